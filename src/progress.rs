use tokio::sync::broadcast;

use crate::session::{Phase, RecordStatus};

/// Bound on the number of undelivered events. A slow consumer loses the oldest events rather
/// than stalling the scan.
pub const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    PhaseStarted { phase: Phase, total: usize },
    /// A directory probe was issued.
    GroupProbed { group: u8 },
    GroupFound { group: u8, descriptor_type: f32, name: String },
    InstancePresence { group: u8, instance: u8, present: bool },
    RegisterRead { group: u8, instance: u8, register: u16, status: RecordStatus },
    PhaseComplete { phase: Phase },
    Log { level: tracing::Level, message: String },
}

pub fn channel() -> (broadcast::Sender<ProgressEvent>, broadcast::Receiver<ProgressEvent>) {
    broadcast::channel(CHANNEL_CAPACITY)
}

/// A one-line rendering of the scan position, as shown by the live status line.
#[derive(Clone, Debug, Default)]
pub struct StatusLine {
    phase: Option<Phase>,
    total: usize,
    done: usize,
    groups: usize,
    present_instances: usize,
    last: Option<String>,
}

impl StatusLine {
    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::PhaseStarted { phase, total } => {
                self.phase = Some(*phase);
                self.total = *total;
                self.done = 0;
            }
            ProgressEvent::GroupProbed { group } => {
                self.done += 1;
                self.last = Some(format!("GG=0x{group:02X}"));
            }
            ProgressEvent::GroupFound { .. } => self.groups += 1,
            ProgressEvent::InstancePresence { group, instance, present } => {
                self.done += 1;
                self.present_instances += usize::from(*present);
                self.last = Some(format!("GG=0x{group:02X} II=0x{instance:02X}"));
            }
            ProgressEvent::RegisterRead { group, instance, register, .. } => {
                self.done += 1;
                self.last =
                    Some(format!("GG=0x{group:02X} II=0x{instance:02X} RR=0x{register:04X}"));
            }
            ProgressEvent::PhaseComplete { .. } | ProgressEvent::Log { .. } => {}
        }
    }

    pub fn render(&self) -> String {
        let phase = self.phase.map(|p| p.to_string()).unwrap_or_else(|| "starting".into());
        let mut line = format!("{phase} {}/{}", self.done, self.total.max(self.done));
        line.push_str(&format!(
            " | groups {} | present instances {}",
            self.groups, self.present_instances
        ));
        if let Some(last) = &self.last {
            line.push_str(" | ");
            line.push_str(last);
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_tracks_position() {
        let mut status = StatusLine::default();
        status.apply(&ProgressEvent::PhaseStarted { phase: Phase::RegisterScan, total: 3 });
        status.apply(&ProgressEvent::RegisterRead {
            group: 2,
            instance: 1,
            register: 0x0F,
            status: RecordStatus::Ok,
        });
        assert_eq!(
            status.render(),
            "register_scan 1/3 | groups 0 | present instances 0 | GG=0x02 II=0x01 RR=0x000F"
        );
    }
}
