use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Number of 100 ns ticks in one second.
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Days from the epoch (1858-11-17) to 1970-01-01.
const UNIX_EPOCH_DAYS: i64 = 40_587;

/// A point in time as a signed 64-bit count of 100 ns ticks since
/// 1858-11-17T00:00:00Z.
///
/// The raw value is the persisted and on-wire representation; everything
/// else (rendering, unix conversion) is derived.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DateTime(i64);

/// A span of time in 100 ns ticks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Elapsed(i64);

impl Elapsed {
    pub const MICRO: Elapsed = Elapsed(10);
    pub const MILLI: Elapsed = Elapsed(10_000);
    pub const SECOND: Elapsed = Elapsed(TICKS_PER_SECOND);
    pub const MINUTE: Elapsed = Elapsed(60 * TICKS_PER_SECOND);

    pub const fn from_raw(ticks: i64) -> Self {
        Elapsed(ticks)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Elapsed(millis * 10_000)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    pub fn as_duration(self) -> std::time::Duration {
        std::time::Duration::from_nanos((self.0.max(0) as u64) * 100)
    }
}

impl DateTime {
    /// The raw value of 1970-01-01T00:00:00Z.
    pub const UNIX_EPOCH_RAW: i64 = UNIX_EPOCH_DAYS * 86_400 * TICKS_PER_SECOND;

    pub const fn from_raw(raw: i64) -> Self {
        DateTime(raw)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    pub const fn epoch() -> Self {
        DateTime(0)
    }

    pub const fn unix_epoch() -> Self {
        DateTime(Self::UNIX_EPOCH_RAW)
    }

    /// Latest representable time (62 bits of ticks).
    pub const fn end_of_time() -> Self {
        DateTime(0x3fff_ffff_ffff_ffff)
    }

    pub const fn beginning_of_time() -> Self {
        DateTime(-0x3fff_ffff_ffff_ffff)
    }

    pub fn now() -> Self {
        let now = chrono::Utc::now();
        let ticks = now.timestamp() * TICKS_PER_SECOND
            + i64::from(now.timestamp_subsec_nanos()) / 100;
        DateTime(Self::UNIX_EPOCH_RAW + ticks)
    }

    pub const fn before(self, elapsed: Elapsed) -> Self {
        DateTime(self.0 - elapsed.0)
    }

    pub const fn after(self, elapsed: Elapsed) -> Self {
        DateTime(self.0 + elapsed.0)
    }

    /// Milliseconds since the unix epoch, the resolution used by DNP3
    /// absolute-time objects.
    pub const fn as_unix_millis(self) -> i64 {
        (self.0 - Self::UNIX_EPOCH_RAW) / 10_000
    }

    pub const fn from_unix_millis(millis: i64) -> Self {
        DateTime(Self::UNIX_EPOCH_RAW + millis * 10_000)
    }

    fn unix_parts(self) -> (i64, u32) {
        let ticks = self.0 - Self::UNIX_EPOCH_RAW;
        let secs = ticks.div_euclid(TICKS_PER_SECOND);
        let sub_ticks = ticks.rem_euclid(TICKS_PER_SECOND) as u32;
        (secs, sub_ticks)
    }
}

impl Add<Elapsed> for DateTime {
    type Output = DateTime;

    fn add(self, rhs: Elapsed) -> DateTime {
        self.after(rhs)
    }
}

impl Sub<DateTime> for DateTime {
    type Output = Elapsed;

    fn sub(self, rhs: DateTime) -> Elapsed {
        Elapsed(self.0 - rhs.0)
    }
}

impl fmt::Display for DateTime {
    /// ISO-8601 UTC with a trailing `Z`. Seconds and the tick fraction are
    /// omitted when zero, so the epoch renders as `1858-11-17T00:00Z`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (secs, sub_ticks) = self.unix_parts();
        let utc = match chrono::DateTime::<chrono::Utc>::from_timestamp(secs, sub_ticks * 100) {
            Some(utc) => utc,
            None => return write!(f, "#{}", self.0),
        };
        write!(f, "{}", utc.format("%Y-%m-%dT%H:%M"))?;
        if secs.rem_euclid(60) != 0 || sub_ticks != 0 {
            write!(f, ":{}", utc.format("%S"))?;
            if sub_ticks != 0 {
                let fraction = format!("{sub_ticks:07}");
                write!(f, ".{}", fraction.trim_end_matches('0'))?;
            }
        }
        write!(f, "Z")
    }
}
