//! Async drive loop for a [`Client`].
//!
//! The client itself never waits on anything. This loop gives it a cadence:
//! on every tick it moves the virtual clock forward by the real time that
//! passed and runs one service pass.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::client::Client;

/// Default tick between service passes.
pub const TICK: Duration = Duration::from_millis(10);

/// Services `client` every `tick` until `done` returns true.
///
/// `done` runs after each pass and may drain the client's queues.
pub async fn drive<F>(client: &mut Client, tick: Duration, mut done: F)
where
    F: FnMut(&mut Client) -> bool,
{
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();

    loop {
        interval.tick().await;
        let now = Instant::now();
        client.clock().advance((now - last).as_secs_f64());
        last = now;

        client.service_all();
        if done(client) {
            break;
        }
    }
}

/// Services `client` until its next response is complete and returns it.
pub async fn next_response(client: &mut Client, tick: Duration) -> Option<crate::Response> {
    let mut response = None;
    drive(client, tick, |client| {
        response = client.pop_response();
        response.is_some()
    })
    .await;
    response
}
