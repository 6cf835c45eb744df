use std::io::{self, Write};

use courier::runner::{self, TICK};
use courier::{Client, Config, Response, VirtualClock};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut cfg = Config::load()?;
    if let Some(target) = std::env::args().nth(1) {
        cfg.set_target(&target)?;
    }

    let clock = VirtualClock::default();
    let mut client = Client::new(cfg, &clock);
    client.transmit()?;

    let mut stdout = io::stdout();
    let mut outcome: io::Result<Option<Response>> = Ok(None);

    tokio::select! {
        _ = runner::drive(&mut client, TICK, |client| {
            outcome = print_ready(client, &mut stdout);
            !matches!(outcome, Ok(None))
        }) => {}

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    match outcome? {
        Some(Response { errored: true, error, .. }) => {
            anyhow::bail!(error.unwrap_or_else(|| "request failed".to_string()))
        }
        _ => Ok(()),
    }
}

/// Writes pending events and, once it arrives, the response.
fn print_ready(client: &mut Client, out: &mut impl Write) -> io::Result<Option<Response>> {
    while let Some(event) = client.pop_event() {
        writeln!(out, "{}", event.data)?;
    }
    out.flush()?;
    let Some(response) = client.pop_response() else {
        return Ok(None);
    };
    if response.status.as_u16() != 0 {
        write!(
            out,
            "HTTP/{}.{} {} {}\r\n{}\r\n",
            response.version.0,
            response.version.1,
            response.status.as_u16(),
            response.reason,
            response.headers
        )?;
        out.write_all(&response.body)?;
        out.flush()?;
    }
    Ok(Some(response))
}
