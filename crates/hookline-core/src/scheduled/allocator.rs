//! Send-time allocation across a campaign's sending window

use chrono::{DateTime, Duration, Utc};

/// Launch date and optional send-by date of a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    pub launch: DateTime<Utc>,
    pub send_by: Option<DateTime<Utc>>,
}

impl SendWindow {
    pub fn new(launch: DateTime<Utc>, send_by: Option<DateTime<Utc>>) -> Self {
        Self { launch, send_by }
    }

    /// Scheduled send time of recipient `index` out of `total`.
    ///
    /// Sends are spread evenly over the window and truncated to whole
    /// minutes, which is the polling granularity of the delivery worker.
    pub fn send_date(&self, index: usize, total: usize) -> DateTime<Utc> {
        let send_by = match self.send_by {
            Some(send_by) if send_by != self.launch && total > 0 => send_by,
            _ => return self.launch,
        };

        let window_minutes = (send_by - self.launch).num_seconds() as f64 / 60.0;
        let minutes_per_send = window_minutes / total as f64;
        let offset = (minutes_per_send * index as f64).floor() as i64;

        self.launch + Duration::minutes(offset)
    }

    /// Send dates for all `total` recipients, in order
    pub fn schedule(&self, total: usize) -> Vec<DateTime<Utc>> {
        (0..total).map(|i| self.send_date(i, total)).collect()
    }
}
