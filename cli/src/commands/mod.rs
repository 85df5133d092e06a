pub mod cidata;
pub mod net;
pub mod usernet;

pub use cidata::{handle_cidata_command, CidataCommands};
pub use net::{handle_net_command, NetCommands};
pub use usernet::{handle_usernet_command, UsernetCommands};
