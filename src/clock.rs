//! Single indirection point for "now", so signature freshness checks stay
//! testable without reaching for a mocking framework.

use time::OffsetDateTime;

pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}
