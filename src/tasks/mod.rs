mod replay;

pub use replay::{replay_once, ReplayTask};
