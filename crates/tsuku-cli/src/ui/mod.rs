//! Terminal output for `tsuku verify`.

pub mod progress;
pub mod render;
pub mod theme;

pub use progress::ProgressReporter;
pub use render::Renderer;
pub use theme::Theme;
