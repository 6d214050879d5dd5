//! RoomLab Core Library
//!
//! Platform-agnostic engine for collaborative 3D room editing: scene and
//! wall state, wall-snap resolution, drag interaction, and the real-time
//! synchronization protocol.

pub mod bus;
pub mod drag;
pub mod protocol;
pub mod scene;
pub mod session;
pub mod snap;
pub mod store;
pub mod walls;

#[cfg(not(target_arch = "wasm32"))]
pub mod transport;

pub use bus::{Finality, MessageBus, NoopBus, ThrottledQueue, BROADCAST_THROTTLE};
pub use drag::{DragController, DragError, DragEvent, Ray};
pub use protocol::{apply_remote, LeaveReason, RoomMessage, RosterEntry, UserData};
pub use scene::{Dimensions, ObjectId, PlacedObject, RoomScene, RoomSnapshot, Wall, WallId};
pub use session::{ChannelAuth, ConnectionState, NoAuth, SessionEvent, SessionManager};
pub use snap::{resolve_snap, SnapConfig, SnapFace, SnapResult, SNAP_DISTANCE, WALL_OFFSET};
pub use store::{
    HistoryEntry, HistoryRecorder, MemoryPersistence, ModelHandle, ModelSource, RoomPersistence,
    RoomStore, StaticModelSource, StoreError,
};
pub use walls::{snap_to_grid, WallDrawOptions, WallRegistry, WallUpdate, GRID_SIZE};

#[cfg(not(target_arch = "wasm32"))]
pub use transport::{ChannelClient, ChannelEvent, ChannelState};
