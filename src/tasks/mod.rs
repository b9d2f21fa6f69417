//! Delegated tasks: the persistent unit of work.

pub mod model;

pub use model::{
    NewTask, NotifyStatus, Routing, Task, TaskContext, TaskFilter, TaskStats, TaskStatus, Usage,
};
