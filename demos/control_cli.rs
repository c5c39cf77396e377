use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use uplifters::{IoError, Result, UpliftDesk};

fn print_command_options() {
    println!("Commands:");
    println!("    h - print this help message");
    println!("    u - move_to_standing");
    println!("    d - move_to_sitting");
    println!("    r - press_raise (empty line releases)");
    println!("    l - press_lower (empty line releases)");
    println!("    v - dump debug info");
    println!("    e - exit");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("Uplifters Control CLI");
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

    desk.register_callback(|state| println!("height update: {state}"))
        .await;

    println!("Height: {:.1}\"", desk.height().await);
    println!("Start typing and press ENTER... Press h for help");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        // EOF behaves like an explicit exit.
        let Ok(Some(line)) = lines.next_line().await else {
            break;
        };

        let result: Result<(), IoError> = match line.trim() {
            "u" => {
                println!("move_to_standing");
                desk.move_to_standing().await
            }
            "d" => {
                println!("move_to_sitting");
                desk.move_to_sitting().await
            }
            "r" => {
                println!("press_raise");
                desk.press_raise().await
            }
            "l" => {
                println!("press_lower");
                desk.press_lower().await
            }
            "" => desk.release().await,
            "h" => {
                print_command_options();
                Ok(())
            }
            "v" => {
                println!("Desk: {}", desk.info());
                println!("Connected: {}", desk.is_connected());
                println!("State: {}", desk.state().await);
                println!("Profile: {:?}", desk.profile());
                Ok(())
            }
            "e" => {
                println!("exit");
                break;
            }
            _ => {
                println!("Unknown command");
                print_command_options();
                Ok(())
            }
        };

        if let Err(e) = result {
            error!("command failed: {}", e);
        }
    }

    println!("Height: {:.1}\"", desk.height().await);
    desk.disconnect().await;
    Ok(())
}
