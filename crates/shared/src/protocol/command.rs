use num_enum::{FromPrimitive, IntoPrimitive};

// Frame commands, one byte on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    // agent -> broker
    Auth = 1,
    Register = 2,
    Bind = 3,
    Pong = 4,
    // broker -> agent
    Connect = 5,
    Ping = 6,
    Event = 7,
    #[num_enum(default)]
    Unknown = 255,
}
