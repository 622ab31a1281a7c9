// Tunnel preamble, sent by the agent right after connecting
pub const TUNNEL_V1_SIGNATURE: &[u8; 8] = b"\x5AMGP\xA5\x01\x00\x00";

// Variable sized payloads carry a u16 big-endian length prefix
pub const MAX_FRAME_PAYLOAD: usize = 65535;

// PROXY protocol signatures
// https://github.com/haproxy/haproxy/blob/master/doc/proxy-protocol.txt
pub const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];
pub const PROXY_V1_SIGNATURE: &[u8; 6] = b"PROXY ";
pub const PROXY_V1_MAX_LINE: usize = 107;
