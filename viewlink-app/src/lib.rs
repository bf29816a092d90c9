pub mod console;
pub mod renderer;

pub use console::{parse_line, ConsoleInput};
pub use renderer::{ConsoleRenderer, ViewState};
