/// Command and kind bytes for the QXW protocol.
/// Format: [magic "QXW"] [command] [kind] [length] [payload...]

/// ASCII "QXW" prefix carried by every frame.
pub const MAGIC: [u8; 3] = *b"QXW";

// Kinds
pub const KIND_REQUEST: u8 = 0x01;
pub const KIND_RESPONSE: u8 = 0x02;
pub const KIND_NOTIFY: u8 = 0x03;

// EQ preset selection
pub const CMD_SELECT_EQ: u8 = 0x10;
pub const SELECT_EQ_PREFIX: u8 = 0x01;

// Custom EQ (sent with KIND_NOTIFY, unlike the other requests)
pub const CMD_CUSTOM_EQ: u8 = 0x20;

// Device info (battery + name)
pub const CMD_DEVICE_INFO: u8 = 0x27;
