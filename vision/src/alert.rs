//! Audible verdict tones, played off the processing thread.

use std::process::{Command, Stdio};
use std::thread;

use code_gate_common::config::AlertConfig;
use code_gate_common::verdict::Verdict;
use crossbeam_channel::{bounded, Sender, TrySendError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tone {
    pub frequency_hz: u32,
    pub duration_ms: u32,
}

impl Tone {
    /// GO is short and high; STOP is long and low.
    pub fn for_verdict(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Go => Self {
                frequency_hz: 1250,
                duration_ms: 200,
            },
            Verdict::Stop => Self {
                frequency_hz: 500,
                duration_ms: 3000,
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("failed to run {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("{0} exited with {1}")]
    Failed(String, std::process::ExitStatus),
}

/// Something that can make a sound. Blocks for the tone's duration.
pub trait TonePlayer: Send {
    fn play(&mut self, tone: Tone) -> Result<(), AlertError>;
}

/// Plays tones through an external program such as `beep`.
pub struct CommandPlayer {
    program: String,
    args: Vec<String>,
}

impl CommandPlayer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Arguments with `{freq}` and `{ms}` filled in.
    fn args_for(&self, tone: Tone) -> Vec<String> {
        let freq = tone.frequency_hz.to_string();
        let ms = tone.duration_ms.to_string();
        self.args
            .iter()
            .map(|a| a.replace("{freq}", &freq).replace("{ms}", &ms))
            .collect()
    }
}

impl TonePlayer for CommandPlayer {
    fn play(&mut self, tone: Tone) -> Result<(), AlertError> {
        let status = Command::new(&self.program)
            .args(self.args_for(tone))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| AlertError::Spawn(self.program.clone(), e))?;
        if !status.success() {
            return Err(AlertError::Failed(self.program.clone(), status));
        }
        Ok(())
    }
}

/// Fire-and-forget handle for queueing tones.
#[derive(Clone)]
pub struct AlertSender {
    tx: Option<Sender<Tone>>,
}

impl AlertSender {
    /// A sender that drops every tone.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue `tone` without blocking. Returns false when it was dropped
    /// because alerts are off, the queue is full, or the worker is gone.
    pub fn notify(&self, tone: Tone) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(tone) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(frequency_hz = tone.frequency_hz, "alert queue full, tone dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Start the alert worker described by `config`.
///
/// The worker exits once every [`AlertSender`] clone is dropped.
pub fn spawn_alert_worker(config: &AlertConfig) -> (AlertSender, Option<thread::JoinHandle<()>>) {
    if !config.enabled {
        info!("audible alerts disabled");
        return (AlertSender::disabled(), None);
    }
    let player = CommandPlayer::new(config.command.clone(), config.args.clone());
    spawn_alert_worker_with(player, config.queue_capacity)
}

pub fn spawn_alert_worker_with<P>(
    mut player: P,
    capacity: usize,
) -> (AlertSender, Option<thread::JoinHandle<()>>)
where
    P: TonePlayer + 'static,
{
    let (tx, rx) = bounded::<Tone>(capacity.max(1));
    let spawned = thread::Builder::new()
        .name("gate-alert".into())
        .spawn(move || {
            for tone in rx {
                if let Err(e) = player.play(tone) {
                    debug!(error = %e, "alert tone not played");
                }
            }
            debug!("alert worker stopped");
        });
    match spawned {
        Ok(handle) => (AlertSender { tx: Some(tx) }, Some(handle)),
        Err(e) => {
            warn!(error = %e, "could not start alert worker, alerts disabled");
            (AlertSender::disabled(), None)
        }
    }
}
