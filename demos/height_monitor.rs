use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};
use uplifters::{Result, UpliftDesk};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("Uplifters Height Monitor");
    info!("Searching for desks...");

    let desk = match UpliftDesk::connect_first().await {
        Ok(desk) => {
            info!("Connected to: {}", desk.info());
            desk
        }
        Err(e) => {
            error!("Failed to connect to a desk: {}", e);
            return Err(e);
        }
    };

    info!("Initial height: {:.1}\"", desk.height().await);

    // Print every update the control box pushes while the desk moves.
    desk.register_callback(|state| {
        info!("height: {:.1}\"  moving: {}", state.height, state.moving);
    })
    .await;

    info!("Driving to the standing preset...");
    if let Err(e) = desk.move_to_standing().await {
        error!("preset command failed: {}", e);
    }

    // Monitor for a minute, refreshing explicitly every 10s in case the desk
    // is idle and pushing nothing.
    for _ in 0..6 {
        sleep(Duration::from_secs(10)).await;
        match desk.refresh_state().await {
            Ok(state) => info!("refresh: {state}"),
            Err(e) => {
                error!("refresh failed: {}", e);
                if e.is_connection_error() {
                    break;
                }
            }
        }
    }

    desk.disconnect().await;
    info!("Done");
    Ok(())
}
