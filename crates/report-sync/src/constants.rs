use std::time::Duration;

/// Trailing debounce applied to the pending-update indicator
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(1500);

/// Delay before a freshly opened view asks for its first refresh
pub const VIEW_OPENED_DELAY: Duration = Duration::from_millis(100);

/// Width of the sliding window used to measure update volume
pub const VOLUME_WINDOW: Duration = Duration::from_secs(60);

/// Tick of the periodic volume and activity monitors
pub const MONITOR_TICK: Duration = Duration::from_secs(1);

/// Activity newer than this counts as "user is active"
pub const USER_ACTIVITY_THRESHOLD: Duration = Duration::from_secs(5);

/// Minimum spacing between presence heartbeats for the local viewer
pub const PRESENCE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Room key prefix for report membership channels
pub const PRESENCE_ROOM_PREFIX: &str = "report-presence:";

/// Display name used when the identity collaborator is unavailable
pub const ANONYMOUS_DISPLAY_NAME: &str = "Anonymous";

/// Pause reason used when a manual pause is requested without one
pub const DEFAULT_MANUAL_PAUSE_REASON: &str = "Paused manually";

/// Pause reason derived from the user-activity monitor
pub const USER_ACTIVITY_PAUSE_REASON: &str = "User is actively working";
