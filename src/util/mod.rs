pub mod buf;
pub mod clock;
pub mod shutdown;
