use std::time::Duration;

/// Client name reported in logs
pub const APP_NAME: &str = "Skyway";

/// Query suffix appended to every bootstrap request
pub const BOOTSTRAP_CLIENT_QUERY: &str = "client=native";

/// Largest message a data channel accepts (the SCTP default of webrtc-rs)
pub const MAX_DATA_MESSAGE_SIZE: usize = 64 * 1024;

/// Size of one data-transfer chunk in bytes (45 KiB). Base64 inflates it to
/// 60 KiB, leaving room for the JSON envelope under [`MAX_DATA_MESSAGE_SIZE`].
pub const CHUNK_SIZE: usize = 45 * 1024;

/// Upper bound on chunks per item; higher chunk ids from a peer are dropped
pub const MAX_TRANSFER_CHUNKS: usize = 1 << 16;

/// Delay before a finished transfer channel is closed, so in-flight
/// acknowledgements can still be delivered.
pub const TRANSFER_CLOSE_GRACE: Duration = Duration::from_millis(1200);

/// Display name used for chat messages echoed back from ourselves
pub const SELF_DISPLAY_NAME: &str = "Me, myself and I";

/// Suffix of the data channel the offerer opens with every peer
pub const DEFAULT_CHANNEL_SUFFIX: &str = "_offer";

/// Default signaling port when the bootstrap response carries none
pub const DEFAULT_SIGNALING_PORT: u16 = 80;

/// Capacity of the command / notification channels between tasks
pub const CHANNEL_CAPACITY: usize = 256;

/// Field index of the candidate type inside an SDP candidate line
pub const CANDIDATE_TYPE_FIELD: usize = 7;
