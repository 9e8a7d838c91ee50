pub mod backup;
pub mod classes;
pub mod core;
pub mod fees;
pub mod students;
pub mod subjects;
