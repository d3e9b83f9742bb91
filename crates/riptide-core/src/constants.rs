/// The unit of transfer over the wire. Fixed by convention across clients.
pub const BLOCK_SIZE: u32 = 16384;
