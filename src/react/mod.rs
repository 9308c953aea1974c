//! 认知层：Planner（prompt 与动作解析）、循环事件、编排主循环

pub mod events;
pub mod loop_;
pub mod planner;

pub use events::LoopEvent;
pub use loop_::{run_goal, LoopContext, LoopOutcome};
pub use planner::{parse_action, Planner, CORRECTIVE_NOTE};
