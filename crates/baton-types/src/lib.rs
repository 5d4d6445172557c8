mod events;
mod history;
mod messages;
mod todo;

pub use events::*;
pub use history::*;
pub use messages::*;
pub use todo::*;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis().max(0)
}

pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
