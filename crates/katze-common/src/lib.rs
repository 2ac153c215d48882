pub mod db;
pub mod evaluator;
pub mod export;
pub mod logging;
pub mod queue;
pub mod run_id;
