pub mod calendar;
pub mod clock;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod ids;
pub mod model;

pub use calendar::Calendar;
pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{CalendarError, NotificationError, PersistenceError};
pub use events::{EventBus, ReminderEvent, StoreChange};
pub use gateway::PersistenceGateway;
pub use ids::{AlarmId, DoseId, DrugId};
pub use model::{Alarm, AlarmTime, DelayKind, DelayedReminderRecord, DoseEntry, Drug, DueTimestamp, PendingDosageInfo};
