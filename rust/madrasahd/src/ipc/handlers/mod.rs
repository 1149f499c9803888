pub mod attendance;
pub mod classes;
pub mod core;
pub mod notifications;
pub mod students;
