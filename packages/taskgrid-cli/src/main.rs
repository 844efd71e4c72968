use clap::{Parser, Subcommand};
use taskgrid_core::instance::InstanceSnapshot;

#[derive(Parser)]
#[command(name = "taskgrid-cli")]
#[command(about = "CLI for the taskgrid-server control plane", long_about = None)]
struct Cli {
    /// Base URL of the taskgrid-server HTTP control plane.
    #[arg(short, long, default_value = "http://localhost:7600")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler registered for a given mode and config index
    Start {
        #[arg(value_parser = ["single", "multi"])]
        mode: String,
        config_index: u32,
    },

    /// Stop a running scheduler by mode and config index
    Stop {
        #[arg(value_parser = ["single", "multi"])]
        mode: String,
        config_index: u32,
    },

    /// List every scheduler the registry currently knows about
    List,

    /// Get the status snapshot for one scheduler
    Status {
        #[arg(value_parser = ["single", "multi"])]
        mode: String,
        config_index: u32,
    },

    /// Print the tail of a task's log file
    TailLog {
        #[arg(value_parser = ["single", "multi"])]
        mode: String,
        config_index: u32,
        queue_id: u32,
        process_index: u32,
        #[arg(short, long, default_value = "100")]
        lines: u32,
    },
}

fn print_snapshot(snap: &InstanceSnapshot) {
    println!("📦 Scheduler {:?}#{} (pid {})", snap.mode, snap.config_index, snap.pid);
    println!("   State: {:?}", snap.state);
    println!("   Chosen devices: {:?}", snap.chosen_devices);
    println!(
        "   Tasks: {} pending, {} running, {} completed, {} failed (of {})",
        snap.pending_tasks, snap.running_tasks, snap.completed_tasks, snap.failed_tasks, snap.total_tasks
    );
    if let Some(err) = &snap.last_error {
        println!("   ⚠️  Last error: {err}");
    }
    for queue in &snap.per_queue {
        println!("   Queue {}: {:?} ({} tasks)", queue.id, queue.state, queue.processes.len());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Start { mode, config_index } => {
            println!("🚀 Starting scheduler {mode}#{config_index}...");
            let url = format!("{}/schedulers/{mode}/{config_index}/start", cli.server);
            let response = client.post(&url).send().await?;
            if response.status().is_success() {
                let body: serde_json::Value = response.json().await?;
                println!("✅ Started, pid {}", body["pid"]);
            } else {
                println!("❌ Failed to start: {} {}", response.status(), response.text().await?);
            }
        }

        Commands::Stop { mode, config_index } => {
            println!("🛑 Stopping scheduler {mode}#{config_index}...");
            let url = format!("{}/schedulers/{mode}/{config_index}/stop", cli.server);
            let response = client.post(&url).send().await?;
            if response.status().is_success() {
                println!("✅ Stopped");
            } else {
                println!("❌ Failed to stop: {} {}", response.status(), response.text().await?);
            }
        }

        Commands::List => {
            let url = format!("{}/schedulers", cli.server);
            let response = client.get(&url).send().await?;
            let snapshots: Vec<InstanceSnapshot> = response.json().await?;
            println!("📋 Running schedulers ({}):", snapshots.len());
            println!();
            for snap in &snapshots {
                print_snapshot(snap);
                println!();
            }
        }

        Commands::Status { mode, config_index } => {
            let url = format!("{}/schedulers/{mode}/{config_index}", cli.server);
            let response = client.get(&url).send().await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                println!("❌ No scheduler found for {mode}#{config_index}");
                return Ok(());
            }
            let snap: InstanceSnapshot = response.json().await?;
            print_snapshot(&snap);
        }

        Commands::TailLog {
            mode,
            config_index,
            queue_id,
            process_index,
            lines,
        } => {
            let url = format!("{}/logs/{mode}/{config_index}/{queue_id}/{process_index}/tail?n={lines}", cli.server);
            let response = client.get(&url).send().await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND || response.status() == reqwest::StatusCode::NO_CONTENT {
                println!("❌ No log bound for {mode}#{config_index} queue {queue_id} process {process_index}");
                return Ok(());
            }
            println!("{}", response.text().await?);
        }
    }

    Ok(())
}
