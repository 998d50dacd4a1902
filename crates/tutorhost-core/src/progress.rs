use tokio::sync::broadcast;
use tutorhost_domain::{DownloadProgress, PhaseEvent, ProvisioningPhase};

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of provisioning progress. Emitting never blocks and never fails;
/// with no subscribers events are simply dropped.
#[derive(Debug, Clone)]
pub struct ProgressChannel {
    tx: broadcast::Sender<PhaseEvent>,
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressChannel {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PhaseEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PhaseEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn phase(&self, phase: ProvisioningPhase) -> PhaseTracker {
        PhaseTracker {
            channel: self.clone(),
            phase,
            last: 0,
        }
    }
}

/// Per-phase reporter; phase-local percent only moves forward.
pub(crate) struct PhaseTracker {
    channel: ProgressChannel,
    phase: ProvisioningPhase,
    last: u8,
}

impl PhaseTracker {
    pub(crate) fn report(&mut self, percent: u8, status: impl Into<String>) {
        self.send(percent, None, None, status.into());
    }

    pub(crate) fn download(&mut self, progress: DownloadProgress, status: &str) {
        self.send(
            progress.percent,
            Some(progress.bytes_downloaded),
            progress.total_bytes,
            status.to_string(),
        );
    }

    pub(crate) fn complete(&mut self, status: impl Into<String>) {
        self.report(100, status);
    }

    fn send(
        &mut self,
        percent: u8,
        bytes_downloaded: Option<u64>,
        total_bytes: Option<u64>,
        status: String,
    ) {
        self.last = self.last.max(percent.min(100));
        self.channel.emit(PhaseEvent {
            phase: self.phase,
            percent: self.phase.overall_percent(self.last),
            phase_percent: self.last,
            bytes_downloaded,
            total_bytes,
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_percent_never_regresses() {
        let channel = ProgressChannel::new();
        let mut rx = channel.subscribe();
        let mut tracker = channel.phase(ProvisioningPhase::DownloadingBase);
        tracker.report(40, "downloading");
        tracker.report(10, "retrying");
        tracker.complete("downloaded");

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let local: Vec<_> = events.iter().map(|e| e.phase_percent).collect();
        assert_eq!(local, vec![40, 40, 100]);
        assert_eq!(events[0].percent, 16);
        assert_eq!(events[2].percent, 33);
    }

    #[test]
    fn download_progress_carries_byte_counts() {
        let channel = ProgressChannel::new();
        let mut rx = channel.subscribe();
        channel
            .phase(ProvisioningPhase::DownloadingCode)
            .download(DownloadProgress::new(50, Some(100)), "sidecar bundle");
        let event = rx.try_recv().unwrap();
        assert_eq!(event.bytes_downloaded, Some(50));
        assert_eq!(event.total_bytes, Some(100));
        assert_eq!(event.phase_percent, 50);
        assert_eq!(event.percent, 61);
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let channel = ProgressChannel::new();
        channel.phase(ProvisioningPhase::Checking).complete("ok");
    }
}
