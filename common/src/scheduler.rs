use crate::{
    config::{DatabaseConfig, DeviceConfig},
    influx::WriteRequest,
    reading::{Reading, SensorError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    Wait,
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Online,
    Restored { downtime_ms: u64 },
    Reconnect { first_attempt: bool },
    Offline,
}

/// Interval gate for reports. The timer starts at boot (0 ms).
#[derive(Debug, Clone)]
pub struct ReportScheduler {
    interval_ms: u64,
    last_report_ms: u64,
}

/// Tracks station connectivity across ticks: one reconnect per tick, outage
/// start remembered so the restore can be reported once.
#[derive(Debug, Clone, Default)]
pub struct LinkSupervisor {
    disconnected_since_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ReportCycle {
    database: DatabaseConfig,
    scheduler: ReportScheduler,
    link: LinkSupervisor,
}

impl ReportScheduler {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_report_ms: 0,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn last_report_ms(&self) -> u64 {
        self.last_report_ms
    }

    pub fn poll(&mut self, now_ms: u64) -> TickAction {
        if now_ms.saturating_sub(self.last_report_ms) < self.interval_ms {
            return TickAction::Wait;
        }

        // Reset before the report runs so a failed read or upload still waits a full interval.
        self.last_report_ms = now_ms;
        TickAction::Report
    }
}

impl LinkSupervisor {
    pub fn is_down(&self) -> bool {
        self.disconnected_since_ms.is_some()
    }

    pub fn check(&mut self, connected: bool, now_ms: u64) -> LinkAction {
        if connected {
            return match self.disconnected_since_ms.take() {
                Some(since) => LinkAction::Restored {
                    downtime_ms: now_ms.saturating_sub(since),
                },
                None => LinkAction::Online,
            };
        }

        let first_attempt = self.disconnected_since_ms.is_none();
        if first_attempt {
            self.disconnected_since_ms = Some(now_ms);
        }
        LinkAction::Reconnect { first_attempt }
    }

    pub fn after_reconnect(&mut self, connected: bool, now_ms: u64) -> LinkAction {
        if connected {
            self.check(true, now_ms)
        } else {
            LinkAction::Offline
        }
    }
}

impl ReportCycle {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            database: config.database.clone(),
            scheduler: ReportScheduler::new(config.report_interval_ms),
            link: LinkSupervisor::default(),
        }
    }

    pub fn scheduler(&self) -> &ReportScheduler {
        &self.scheduler
    }

    pub fn check_link(&mut self, connected: bool, now_ms: u64) -> LinkAction {
        self.link.check(connected, now_ms)
    }

    pub fn after_reconnect(&mut self, connected: bool, now_ms: u64) -> LinkAction {
        self.link.after_reconnect(connected, now_ms)
    }

    pub fn poll(&mut self, now_ms: u64) -> TickAction {
        self.scheduler.poll(now_ms)
    }

    pub fn on_reading(&self, reading: Result<Reading, SensorError>) -> Option<WriteRequest> {
        let reading = reading.ok()?;
        Some(WriteRequest::new(&self.database, &reading))
    }
}
