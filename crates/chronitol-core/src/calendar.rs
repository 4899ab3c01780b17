use chrono::{DateTime, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::errors::CalendarError;

/// The calendar used for "start of day" and wall-clock alarm math.
///
/// `Local` follows the host's current zone; `Zone` pins an IANA zone
/// (used by tests and by the `calendar.timeZone` setting).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Calendar {
    #[default]
    Local,
    Zone(Tz),
}

impl Calendar {
    /// Resolve an optional IANA zone name. `None`, `""` and `"local"` mean the host zone.
    pub fn from_name(name: Option<&str>) -> Result<Self, CalendarError> {
        match name.map(str::trim) {
            None | Some("") => Ok(Self::Local),
            Some(n) if n.eq_ignore_ascii_case("local") => Ok(Self::Local),
            Some(n) => n
                .parse::<Tz>()
                .map(Self::Zone)
                .map_err(|_| CalendarError::UnknownZone(n.to_string())),
        }
    }

    /// First instant of the local calendar day containing `at`.
    pub fn start_of_day(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Local => start_of_day_in(&Local, at),
            Self::Zone(tz) => start_of_day_in(tz, at),
        }
    }

    /// Local calendar date of `at`.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::Local => at.with_timezone(&Local).date_naive(),
            Self::Zone(tz) => at.with_timezone(tz).date_naive(),
        }
    }

    /// Next instant strictly after `after` whose wall clock reads `hour:minute`.
    /// A wall time that falls in a DST gap resolves to the first valid instant after it.
    pub fn next_occurrence(&self, hour: u8, minute: u8, after: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Local => next_occurrence_in(&Local, hour, minute, after),
            Self::Zone(tz) => next_occurrence_in(tz, hour, minute, after),
        }
    }

    /// Latest instant at or before `at` whose wall clock reads `hour:minute`.
    pub fn latest_occurrence(&self, hour: u8, minute: u8, at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Local => latest_occurrence_in(&Local, hour, minute, at),
            Self::Zone(tz) => latest_occurrence_in(tz, hour, minute, at),
        }
    }

    /// Whether `a` and `b` fall on the same local calendar day.
    pub fn same_day(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        self.local_date(a) == self.local_date(b)
    }
}

fn start_of_day_in<Z: TimeZone>(tz: &Z, at: DateTime<Utc>) -> DateTime<Utc> {
    let date = at.with_timezone(tz).date_naive();
    resolve_wall_clock(tz, date.and_time(NaiveTime::MIN))
}

fn wall_time(hour: u8, minute: u8) -> NaiveTime {
    NaiveTime::from_hms_opt(u32::from(hour.min(23)), u32::from(minute.min(59)), 0).unwrap_or(NaiveTime::MIN)
}

fn latest_occurrence_in<Z: TimeZone>(tz: &Z, hour: u8, minute: u8, at: DateTime<Utc>) -> DateTime<Utc> {
    let time = wall_time(hour, minute);
    let mut date = at.with_timezone(tz).date_naive();
    for _ in 0..3 {
        let candidate = resolve_wall_clock(tz, date.and_time(time));
        if candidate <= at {
            return candidate;
        }
        date = date.pred_opt().unwrap_or(date);
    }
    at - Duration::days(1)
}

fn next_occurrence_in<Z: TimeZone>(tz: &Z, hour: u8, minute: u8, after: DateTime<Utc>) -> DateTime<Utc> {
    let time = wall_time(hour, minute);
    let mut date = after.with_timezone(tz).date_naive();
    // Two days always suffice; the third covers a skipped wall time that
    // resolves onto the following day.
    for _ in 0..3 {
        let candidate = resolve_wall_clock(tz, date.and_time(time));
        if candidate > after {
            return candidate;
        }
        date = date.succ_opt().unwrap_or(date);
    }
    after + Duration::days(1)
}

/// Map a wall-clock time to an instant. Ambiguous times take the earlier
/// instant; times inside a gap move forward to where the gap ends.
fn resolve_wall_clock<Z: TimeZone>(tz: &Z, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let mut probe = naive;
            for _ in 0..(4 * 24) {
                probe += Duration::minutes(15);
                if let Some(dt) = tz.from_local_datetime(&probe).earliest() {
                    return dt.with_timezone(&Utc);
                }
            }
            Utc.from_utc_datetime(&naive)
        }
    }
}
