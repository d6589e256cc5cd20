//! REPL – Read-Eval-Print Loop for the POCS operator shell.
//!
//! Supported slash-commands:
//!   /help                 – show this list
//!   /status               – print and publish the controller status
//!   /messaging            – start the message relay
//!   /polar [east|west|all] – run the polar alignment test
//!   /listen               – dispatch remote commands until Ctrl-C
//!   /park /unpark /home   – mount commands
//!   /social               – toggle forwarding of chat status to Slack/Twitter
//!   /quit | /exit         – park, power down, and exit
//!
//! Stdin is read on its own thread so the loop can also react to a Ctrl-C
//! shutdown request while waiting for input.

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};

use pocs_middleware::{
    RelayChannel, SlackSink, StatusSink, Subscriber, TwitterSink, run_status_forwarder,
};
use pocs_runtime::{CaptureOutcome, MountWait, PolarAlignmentReport, Session};
use pocs_types::{CHAT_TOPIC, Direction, PocsError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;

// ─────────────────────────────────────────────────────────────────────────────
// Interrupt routing
// ─────────────────────────────────────────────────────────────────────────────

/// Routes Ctrl-C to the operation currently running, if any.
///
/// A long-running command arms the slot for its duration.  Ctrl-C cancels
/// the armed token; with nothing armed it requests shell shutdown instead.
#[derive(Clone, Default)]
pub struct InterruptSlot {
    armed: Arc<Mutex<Option<CancellationToken>>>,
}

impl InterruptSlot {
    /// Arm a fresh token for the next operation.
    pub fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.armed.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        token
    }

    pub fn disarm(&self) {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Cancel the armed operation.  Returns `false` when nothing was armed.
    pub fn fire(&self) -> bool {
        match self.armed.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shell
// ─────────────────────────────────────────────────────────────────────────────

struct SocialForwarder {
    stop: CancellationToken,
    task: JoinHandle<usize>,
}

pub struct Shell {
    session: Session,
    config: Config,
    interrupts: InterruptSlot,
    shutdown: CancellationToken,
    social: Option<SocialForwarder>,
}

impl Shell {
    pub fn new(
        session: Session,
        config: Config,
        interrupts: InterruptSlot,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            session,
            config,
            interrupts,
            shutdown,
            social: None,
        }
    }

    /// Run until `/quit`, end of input, or a shutdown request, then park
    /// and power down.
    pub async fn run(mut self) {
        let mut lines = spawn_stdin_reader();

        loop {
            print!("{} ", "pocs>".bold().cyan());
            io::stdout().flush().ok();

            let line = tokio::select! {
                () = self.shutdown.cancelled() => break,
                line = lines.recv() => line,
            };
            let Some(line) = line else {
                break; // EOF
            };
            let cmd = line.trim();
            if cmd.is_empty() {
                continue;
            }
            if !self.dispatch(cmd).await {
                break;
            }
        }

        self.shut_down().await;
    }

    /// Execute one command line.  Returns `false` when the shell should exit.
    async fn dispatch(&mut self, line: &str) -> bool {
        let mut words = line.split_whitespace();
        let cmd = words.next().unwrap_or_default();
        let arg = words.next();

        match cmd {
            "/help" => cmd_help(),
            "/status" => self.cmd_status().await,
            "/messaging" => self.cmd_messaging().await,
            "/polar" => match parse_directions(arg) {
                Ok(directions) => self.cmd_polar(&directions).await,
                Err(e) => println!("{}: {}", "Usage".red(), e),
            },
            "/listen" => self.cmd_listen().await,
            "/park" => report("Park", self.session.park().await),
            "/unpark" => report("Unpark", self.session.unpark().await),
            "/home" => {
                let interrupt = self.interrupts.arm();
                let result = self.session.home(&interrupt).await;
                self.interrupts.disarm();
                if result == Ok(MountWait::Interrupted) {
                    println!("  {}", "Slew interrupted; mount parked.".yellow());
                } else {
                    report("Home", result.map(|_| ()));
                }
            }
            "/social" => self.cmd_social().await,
            "/quit" | "/exit" => {
                println!("{}", "Goodbye.".green());
                return false;
            }
            other => {
                println!(
                    "{} '{}'. Type {} for available commands.",
                    "Unknown command:".red(),
                    other.yellow(),
                    "/help".bold()
                );
            }
        }
        true
    }

    // ── Command handlers ──────────────────────────────────────────────────

    async fn cmd_status(&mut self) {
        let Some(controller) = self.session.controller() else {
            println!("{}", "No controller attached.".red());
            return;
        };
        let status = controller.status();
        println!("{}", "Observatory Status".bold().underline());
        println!("  State        : {}", status.state.yellow());
        println!("  Safe         : {}", flag(status.is_safe));
        println!("  Weather safe : {}", flag(status.is_weather_safe));
        println!(
            "  Mount        : parked={} slewing={} home={}",
            status.mount.parked, status.mount.slewing, status.mount.home
        );
        println!("  Cameras      : {}", status.cameras.join(", "));
        println!("  Session      : {:?}", self.session.state());

        if self.session.is_messaging() {
            if let Err(e) = self.session.publish_status().await {
                println!("  {}: {}", "Status not published".yellow(), e);
            }
        }
    }

    async fn cmd_messaging(&mut self) {
        let result = self.session.start_messaging().await;
        for channel in [RelayChannel::Command, RelayChannel::Status] {
            match self.session.relay_route(channel) {
                Some(route) => println!(
                    "  {} {} relay {} → {}",
                    "🟢".green(),
                    channel.name().bold(),
                    route.inbound_port,
                    route.outbound_port
                ),
                None => println!("  {} {} relay {}", "🔴".red(), channel.name().bold(), "unavailable".red()),
            }
        }
        if let Err(e) = result {
            println!("{}: {} (run /messaging again to retry)", "Messaging error".red(), e);
        }
    }

    async fn cmd_polar(&mut self, directions: &[Direction]) {
        println!(
            "  Polar alignment test ({}). Press {} to interrupt.",
            directions.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
            "Ctrl-C".bold()
        );
        let interrupt = self.interrupts.arm();
        let result = self.session.polar_alignment_test(directions, &interrupt).await;
        self.interrupts.disarm();
        match result {
            Ok(report) => print_alignment(&report),
            Err(e) => println!("{}: {}", "Polar alignment failed".red(), e),
        }
    }

    async fn cmd_listen(&mut self) {
        println!("  Listening for remote commands. Press {} to stop.", "Ctrl-C".bold());
        let interrupt = self.interrupts.arm();
        let result = self.session.listen(&interrupt).await;
        self.interrupts.disarm();
        match result {
            Ok(r) => println!(
                "  Stopped ({:?}): {} dispatched, {} ignored, {} failed",
                r.ended, r.dispatched, r.ignored, r.failed
            ),
            Err(e) => println!("{}: {} (try /messaging first)", "Cannot listen".red(), e),
        }
    }

    async fn cmd_social(&mut self) {
        if let Some(social) = self.social.take() {
            social.stop.cancel();
            let forwarded = social.task.await.unwrap_or_default();
            println!("  Social forwarding stopped after {} message(s).", forwarded);
            return;
        }
        let sinks = social_sinks(&self.config);
        if sinks.is_empty() {
            println!(
                "{} set {} (or {}) or a {} section in the config.",
                "No social sink configured:".red(),
                "slack_webhook".bold(),
                "POCS_SLACK_WEBHOOK".bold(),
                "[twitter]".bold()
            );
            return;
        }
        let Some(route) = self.session.relay_route(RelayChannel::Status) else {
            println!("{} (try /messaging first)", "Status relay is not running".red());
            return;
        };
        let mut subscriber = match Subscriber::connect(&self.config.host, route.outbound_port).await {
            Ok(s) => s,
            Err(e) => {
                println!("{}: {}", "Cannot subscribe to status".red(), e);
                return;
            }
        };

        let names = sinks.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ");
        let stop = self.shutdown.child_token();
        let token = stop.clone();
        let task = tokio::spawn(async move {
            run_status_forwarder(&mut subscriber, CHAT_TOPIC, &sinks, &token).await
        });
        self.social = Some(SocialForwarder { stop, task });
        println!(
            "  {} Forwarding {} messages to {}. Run /social again to stop.",
            "✓".green(),
            CHAT_TOPIC.bold(),
            names.bold()
        );
    }

    async fn shut_down(mut self) {
        if let Some(social) = self.social.take() {
            social.stop.cancel();
            if let Err(e) = social.task.await {
                warn!(error = %e, "social forwarder task failed");
            }
        }
        println!("{}", "  Parking mount and powering down …".yellow());
        match self.session.power_down().await {
            Ok(()) => println!("{}", "  ✓ Observatory powered down.".green()),
            Err(e) => println!("{}: {}", "  Power down failed".red(), e),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "POCS Commands".bold().underline());
    println!("  {}               – controller status (published when messaging is up)", "/status".bold().cyan());
    println!("  {}            – start the command and status relays", "/messaging".bold().cyan());
    println!("  {} – polar alignment test (default east)", "/polar [east|west|all]".bold().cyan());
    println!("  {}               – run remote commands until Ctrl-C", "/listen".bold().cyan());
    println!("  {}   – mount commands", "/park /unpark /home".bold().cyan());
    println!("  {}               – toggle chat forwarding to Slack/Twitter", "/social".bold().cyan());
    println!("  {}         – park, power down, and exit", "/quit  /exit".bold().cyan());
    println!();
}

/// `None` and `east` → east only; `west` → west only; `all` → east then west.
pub(crate) fn parse_directions(arg: Option<&str>) -> Result<Vec<Direction>, String> {
    match arg.map(str::to_lowercase).as_deref() {
        None | Some("east") => Ok(vec![Direction::East]),
        Some("west") => Ok(vec![Direction::West]),
        Some("all") => Ok(vec![Direction::East, Direction::West]),
        Some(other) => Err(format!("/polar [east|west|all], got '{other}'")),
    }
}

fn report(what: &str, result: Result<(), PocsError>) {
    match result {
        Ok(()) => println!("  {} {}", "✓".green(), what),
        Err(e) => println!("{}: {}", format!("{what} refused").red(), e),
    }
}

/// Every sink the config has credentials for.
fn social_sinks(config: &Config) -> Vec<Box<dyn StatusSink>> {
    let mut sinks: Vec<Box<dyn StatusSink>> = Vec::new();
    if !config.slack_webhook.is_empty() {
        sinks.push(Box::new(
            SlackSink::new(config.slack_webhook.clone()).with_timestamp(config.slack_timestamp),
        ));
    }
    if let Some(twitter) = &config.twitter {
        sinks.push(Box::new(
            TwitterSink::new(twitter.credentials()).with_timestamp(twitter.timestamp),
        ));
    }
    sinks
}

fn flag(value: bool) -> colored::ColoredString {
    if value { "yes".green() } else { "no".red() }
}

fn print_alignment(report: &PolarAlignmentReport) {
    for phase in &report.sweep.phases {
        let Some(batch) = &phase.batch else {
            println!("  {} {}", phase.label.bold(), "interrupted before capture".yellow());
            continue;
        };
        println!("  {} ({:.1?})", phase.label.bold(), batch.elapsed);
        for result in &batch.results {
            let outcome = match &result.outcome {
                CaptureOutcome::Completed => "completed".green(),
                CaptureOutcome::TimedOut => "timed out".red(),
                CaptureOutcome::Failed(reason) => format!("failed: {reason}").red(),
                CaptureOutcome::LaunchFailed(reason) => format!("launch failed: {reason}").red(),
                CaptureOutcome::Interrupted => "interrupted".yellow(),
                CaptureOutcome::Abandoned => "abandoned".yellow(),
                CaptureOutcome::NotLaunched => "not launched".yellow(),
            };
            println!("    {} {} {}", result.device, outcome, result.path.display().to_string().dimmed());
        }
    }
    if report.sweep.interrupted {
        println!("  {}", "Test interrupted.".yellow());
    }
    if !report.sweep.returned_home {
        println!("  {}", "Mount did not confirm return to home.".red());
    }
    if let Some(m) = &report.measurement {
        let d = m.delta();
        println!("  Offset: dx={:.2} dy={:.2}", d.x, d.y);
    }
}

/// Read stdin lines on a dedicated thread.  The channel closes at EOF.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = io::stdin();
        loop {
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("{}: {}", "Read error".red(), e);
                    break;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polar_arguments() {
        assert_eq!(parse_directions(None), Ok(vec![Direction::East]));
        assert_eq!(parse_directions(Some("WEST")), Ok(vec![Direction::West]));
        assert_eq!(
            parse_directions(Some("all")),
            Ok(vec![Direction::East, Direction::West])
        );
        assert!(parse_directions(Some("north")).is_err());
    }

    #[test]
    fn social_sinks_follow_configured_credentials() {
        let mut cfg = Config::default();
        assert!(social_sinks(&cfg).is_empty());

        cfg.slack_webhook = "https://hooks.slack.com/services/T/B/x".to_string();
        cfg.twitter = Some(crate::config::TwitterConfig {
            consumer_key: "ck".into(),
            consumer_secret: "cs".into(),
            access_token: "at".into(),
            access_token_secret: "ats".into(),
            timestamp: false,
        });
        let names: Vec<String> = social_sinks(&cfg).iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["slack", "twitter"]);
    }

    #[test]
    fn fire_cancels_only_the_armed_token() {
        let slot = InterruptSlot::default();
        assert!(!slot.fire());

        let token = slot.arm();
        let shared = slot.clone();
        assert!(shared.fire());
        assert!(token.is_cancelled());
        assert!(!slot.fire());

        let token = slot.arm();
        slot.disarm();
        assert!(!slot.fire());
        assert!(!token.is_cancelled());
    }
}
