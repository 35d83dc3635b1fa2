//! Voice CLI - VoIP call session controller
//!
//! Drives the call session controller against a simulated telephony UI and
//! calling SDK, and manages the cached push registration.

mod config;
mod push;
mod session;
mod sim;

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use session::collaborators::PermissionChoice;
use sim::scenario::{self, InCall, IncomingAction};
use sim::SimOptions;

#[derive(Parser)]
#[command(name = "voice-cli")]
#[command(about = "VoIP call session controller with a simulated platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a simulated outgoing call
    Call {
        /// Number or client identity to call
        destination: String,

        /// Line group to place the call on
        #[arg(short, long, default_value = "0")]
        line: u8,

        /// Seconds to keep the call up before hanging up
        #[arg(short, long, default_value = "5")]
        duration: u64,

        /// Simulate a denied microphone permission
        #[arg(long)]
        deny_mic: bool,

        /// With --deny-mic, continue the call without a microphone
        #[arg(long, requires = "deny_mic")]
        continue_without_mic: bool,

        /// Make the SDK fail to connect
        #[arg(long)]
        fail: bool,

        /// Raise and then clear call quality warnings
        #[arg(long)]
        degrade: bool,

        /// Mute the microphone once connected
        #[arg(long)]
        mute: bool,

        /// DTMF digits to send once connected
        #[arg(long)]
        digits: Option<String>,
    },

    /// Receive a simulated incoming call
    Incoming {
        /// Caller identity or number
        from: String,

        /// Caller hangs up before the call is answered
        #[arg(long, conflicts_with = "decline")]
        cancel: bool,

        /// Decline the call
        #[arg(long)]
        decline: bool,

        /// Seconds until the caller hangs up after answering
        #[arg(short, long, default_value = "5")]
        duration: u64,

        /// Raise and then clear call quality warnings
        #[arg(long)]
        degrade: bool,
    },

    /// Register a device token for incoming-call pushes
    Register {
        /// Device token (hex)
        device_token: String,

        /// Register even if the cached registration is fresh
        #[arg(short, long)]
        force: bool,
    },

    /// Forget the cached push registration
    Unregister,

    /// Show identity, push registration and call settings
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Call {
            destination,
            line,
            duration,
            deny_mic,
            continue_without_mic,
            fail,
            degrade,
            mute,
            digits,
        } => {
            let settings = config::Config::load()?.controller_settings();
            let opts = SimOptions {
                deny_microphone: deny_mic,
                prompt_choice: if continue_without_mic {
                    PermissionChoice::ContinueWithoutMicrophone
                } else {
                    PermissionChoice::Cancel
                },
                fail_connect: fail,
                degrade,
                ..SimOptions::default()
            };
            scenario::run_outgoing(
                settings,
                &destination,
                line,
                Duration::from_secs(duration),
                InCall { mute, digits },
                opts,
            )
            .await?;
        }
        Commands::Incoming {
            from,
            cancel,
            decline,
            duration,
            degrade,
        } => {
            let settings = config::Config::load()?.controller_settings();
            let action = if cancel {
                IncomingAction::Cancel
            } else if decline {
                IncomingAction::Decline
            } else {
                IncomingAction::Answer
            };
            let opts = SimOptions {
                degrade,
                ..SimOptions::default()
            };
            scenario::run_incoming(settings, &from, action, Duration::from_secs(duration), opts)
                .await?;
        }
        Commands::Register {
            device_token,
            force,
        } => {
            push::register(&device_token, force)?;
        }
        Commands::Unregister => {
            push::unregister()?;
        }
        Commands::Status => {
            push::status()?;
        }
    }

    Ok(())
}
