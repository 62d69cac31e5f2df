pub mod analysis;
pub mod auth;
pub mod classes;
pub mod core;
pub mod exams;
pub mod grade_levels;
pub mod import;
pub mod invitations;
pub mod parents;
pub mod schools;
pub mod scores;
pub mod semesters;
pub mod students;
pub mod teachers;
