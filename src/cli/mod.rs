pub mod args;

pub use args::{
    Cli, Commands, ImageArgs, ImageCommands, InspectArgs, NameArgs, NetworkArgs, NetworkCommands,
    NetworkDownArgs, PsArgs, PullArgs, VmSelectionArgs,
};
