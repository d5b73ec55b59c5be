//! crawldeck console
//!
//! Drives the active-profile selection from a terminal, the same way a view would:
//! every command mounts (fetch + reconcile) before acting.
//!
//! ```text
//! crawldeck-console [--ephemeral] [watch|list|current|select <id>|show <id>|create <name> <token>|forget]
//! ```

use crawldeck_core::{
    ActiveSelectionRegistry, MountOutcome, Profile, ProfileDraft, SelectionConfig,
    SelectionController, SelectionEvent,
};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
enum Command {
    Watch,
    List,
    Current,
    Select(i64),
    Show(i64),
    Create { name: String, token: String },
    Forget,
}

const USAGE: &str =
    "usage: crawldeck-console [--ephemeral] [watch|list|current|select <id>|show <id>|create <name> <token>|forget]";

fn parse_args(args: &[String]) -> Result<(Command, bool), BoxError> {
    let ephemeral = args.iter().any(|a| a == "--ephemeral");
    let rest: Vec<&str> = args
        .iter()
        .map(String::as_str)
        .filter(|a| *a != "--ephemeral")
        .collect();
    let id_arg = |i: usize| -> Result<i64, BoxError> {
        rest.get(i)
            .ok_or_else(|| BoxError::from(USAGE))?
            .parse::<i64>()
            .map_err(|e| format!("invalid profile id: {}", e).into())
    };
    let command = match rest.first().copied() {
        None | Some("watch") => Command::Watch,
        Some("list") => Command::List,
        Some("current") => Command::Current,
        Some("select") => Command::Select(id_arg(1)?),
        Some("show") => Command::Show(id_arg(1)?),
        Some("create") => match (rest.get(1), rest.get(2)) {
            (Some(name), Some(token)) => Command::Create {
                name: name.to_string(),
                token: token.to_string(),
            },
            _ => return Err(USAGE.into()),
        },
        Some("forget") => Command::Forget,
        Some(other) => return Err(format!("unknown command '{}'\n{}", other, USAGE).into()),
    };
    Ok((command, ephemeral))
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[crawldeck-console] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("[crawldeck-console] {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BoxError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, ephemeral) = parse_args(&args)?;
    let config = SelectionConfig::load()?;
    let controller = SelectionController::from_config(&config, ActiveSelectionRegistry::new(), ephemeral)?;

    match command {
        Command::Watch => watch(&controller, &config).await?,
        Command::List => {
            let out = controller.mount().await;
            report(&out);
            let active = controller.current().map(|p| p.id);
            for p in controller.selectable() {
                let marker = if Some(p.id) == active { "*" } else { " " };
                println!("{} {:>5}  {}", marker, p.id, p.name);
            }
            out.confirmed().await;
        }
        Command::Current => {
            let out = controller.mount().await;
            report(&out);
            print_profile(controller.current().as_ref())?;
            out.confirmed().await;
        }
        Command::Select(id) => {
            let out = controller.mount().await;
            let profile = controller.select_id(id)?;
            out.confirmed().await;
            println!("active profile: {} ({})", profile.name, profile.id);
        }
        Command::Show(id) => {
            let profile = controller.profile_details(id).await?;
            print_profile(Some(&profile))?;
        }
        Command::Create { name, token } => {
            let (created, out) = controller.create_profile(ProfileDraft::new(name, token)).await?;
            println!("created profile: {} ({})", created.name, created.id);
            report(&out);
            out.confirmed().await;
        }
        Command::Forget => {
            controller.forget()?;
            println!("active profile cleared");
        }
    }
    controller.flush().await?;
    Ok(())
}

async fn watch(controller: &SelectionController, config: &SelectionConfig) -> Result<(), BoxError> {
    let mut events = controller.events();
    report(&controller.mount().await);

    let refreshing = config.refresh_interval_secs > 0;
    let period = Duration::from_secs(config.refresh_interval_secs.max(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    tracing::info!(
        refresh_interval_secs = config.refresh_interval_secs,
        "watching active profile selection"
    );

    loop {
        tokio::select! {
            _ = interval.tick(), if refreshing => {
                report(&controller.mount().await);
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "selection events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; stopping watch");
                break;
            }
        }
    }
    Ok(())
}

fn report(out: &MountOutcome) {
    match out {
        MountOutcome::Applied { outcome, .. } => {
            if let Some(err) = &outcome.error {
                println!("profiles unavailable: {}", err);
            }
            if outcome.filtered_out > 0 && outcome.selectable.is_empty() {
                println!(
                    "found {} profile(s) but all were filtered out as drafts",
                    outcome.filtered_out
                );
            }
            match &outcome.active {
                Some(p) => println!("[{:?}] active: {} ({})", outcome.state, p.name, p.id),
                None => println!("[{:?}] no active profile", outcome.state),
            }
        }
        MountOutcome::Superseded => {}
    }
}

fn print_event(event: &SelectionEvent) {
    match event {
        SelectionEvent::StateChanged { from, to } => println!("state: {:?} -> {:?}", from, to),
        SelectionEvent::FetchFailed { message } => println!("fetch failed: {}", message),
        other => println!("{:?}", other),
    }
}

fn print_profile(profile: Option<&Profile>) -> Result<(), BoxError> {
    match profile {
        Some(p) => println!("{}", serde_json::to_string_pretty(p)?),
        None => println!("null"),
    }
    Ok(())
}
