pub mod icons;
pub mod progress;
pub mod report;

pub use progress::BatchUI;
