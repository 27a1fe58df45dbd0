pub mod common;
pub mod console;
pub mod destroy;
pub mod doctor;
pub mod image;
pub mod inspect;
pub mod network;
pub mod ps;
pub mod pull;
pub mod ssh;
pub mod stop;
pub mod up;
pub mod version;

pub use console::cmd_console;
pub use destroy::cmd_destroy;
pub use doctor::cmd_doctor;
pub use image::cmd_image_ls;
pub use inspect::cmd_inspect;
pub use network::{cmd_network_down, cmd_network_ls};
pub use ps::cmd_ps;
pub use pull::cmd_pull;
pub use ssh::cmd_ssh;
pub use stop::cmd_stop;
pub use up::cmd_up;
pub use version::cmd_version;
