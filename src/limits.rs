/// Cells a single grid spec may expand to.
pub const MAX_GRID_CELLS: usize = 100;

/// Insert attempts for one reservation before giving up with `NoAvailability`.
pub const MAX_RESERVE_ATTEMPTS: usize = 3;

/// Cells around a displaced space searched for an alternative (1 = 3 x 3 block).
pub const RELOCATION_RADIUS: i64 = 1;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_MARKINGS_LEN: usize = 64;
pub const MAX_VEHICLE_ID_LEN: usize = 32;
pub const MAX_DEVICE_ID_LEN: usize = 256;
pub const MAX_VEHICLES_PER_USER: usize = 16;
pub const MAX_DEVICES_PER_USER: usize = 16;

/// Largest frame either gateway port accepts.
pub const MAX_FRAME_LEN: usize = 4 * 1024;
