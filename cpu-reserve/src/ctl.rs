//! cpu-reservectl - CPU reservation control utility

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use cpu_reserve::config::default_socket_path;
use cpu_reserve::controller::{AddRequest, ChangeRequest};
use cpu_reserve::ipc::IpcClient;
use cpu_reserve::kernel::PeriodicMode;
use cpu_reserve::ThreadId;

/// CPU reservation control utility
#[derive(Parser)]
#[command(name = "cpu-reservectl", version, about = "Control the CPU reservation daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Socket path
    #[arg(long, env = "CPU_RESERVE_SOCKET", default_value_t = default_socket_path())]
    socket: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List all reservations
    List,

    /// Reserve a periodic budget
    Add {
        /// Thread as task.lthread (hex)
        thread: ThreadId,
        /// Priority, larger is more important
        #[arg(short, long)]
        priority: u32,
        /// Period (us)
        #[arg(short = 'T', long)]
        period: u64,
        /// Worst-case execution time (us)
        #[arg(short = 'C', long)]
        wcet: u64,
        /// Deadline (us), 0 for none
        #[arg(short = 'D', long, default_value_t = 0)]
        deadline: u64,
        /// Reservation name
        #[arg(short, long, default_value = "")]
        name: String,
    },

    /// Register a delayed-preemption section
    Dp {
        thread: ThreadId,
        /// Timeslice id to extend, 0 for the non-real-time one
        id: u32,
        /// Longest non-preemptible section (us)
        delay: u64,
    },

    /// Change a periodic reservation
    Change {
        thread: ThreadId,
        id: u32,
        #[arg(short, long)]
        priority: Option<u32>,
        #[arg(short = 'C', long)]
        wcet: Option<u64>,
        #[arg(short = 'D', long)]
        deadline: Option<u64>,
    },

    /// Delete all reservations of a thread
    DeleteThread { thread: ThreadId },

    /// Delete all reservations of the thread's task
    DeleteTask { thread: ThreadId },

    /// Start periodic execution
    Begin {
        thread: ThreadId,
        /// Absolute start time
        #[arg(long, default_value_t = 0)]
        clock: u64,
        #[arg(long, value_enum, default_value_t = Mode::Strict)]
        mode: Mode,
    },

    /// Stop periodic execution
    End { thread: ThreadId },

    /// Watch preemptions of a thread's primary reservation
    Watch { thread: ThreadId },

    /// Show overrun counters of a watched reservation
    Counters { thread: ThreadId },

    /// Show the response time of a reservation
    TimeDemand { thread: ThreadId, id: u32 },

    /// Show the scheduler granularity
    Granularity,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Strict,
    Minimal,
}

impl From<Mode> for PeriodicMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Strict => PeriodicMode::Strict,
            Mode::Minimal => PeriodicMode::Minimal,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = IpcClient::new(&cli.socket);

    match cli.command {
        Commands::List => {
            let list = client.list().await?;
            println!(
                "{:<16} {:>12} {:>3} {:>5} {:>10} {:>10} {:>10} {:<8}",
                "NAME", "THREAD", "ID", "PRIO", "PERIOD", "WCET", "DEADLINE", "WATCH"
            );
            for r in &list {
                let period = if r.delayed_preemption {
                    "dp".to_string()
                } else {
                    r.period_us.to_string()
                };
                println!(
                    "{:<16} {:>12} {:>3} {:>5} {:>10} {:>10} {:>10} {:<8}",
                    r.name,
                    r.thread.to_string(),
                    r.id,
                    r.priority,
                    period,
                    r.wcet_us,
                    r.deadline_us,
                    format!("{:?}", r.watcher)
                );
                if let Some(h) = &r.histogram {
                    println!(
                        "    {} samples, min={:?} max={:?} mean={:?} (us)",
                        h.samples, h.min_us, h.max_us, h.mean_us
                    );
                }
            }
            println!("\nTotal: {} reservations", list.len());
        }

        Commands::Add {
            thread,
            priority,
            period,
            wcet,
            deadline,
            name,
        } => {
            let admission = client
                .add(AddRequest {
                    thread,
                    name,
                    priority,
                    period_us: period,
                    wcet_us: wcet,
                    deadline_us: deadline,
                })
                .await?;
            println!(
                "Admitted {}/{} with wcet {}us",
                thread, admission.id, admission.wcet_us
            );
        }

        Commands::Dp { thread, id, delay } => {
            let delay = client.delayed_preempt(thread, id, delay).await?;
            println!("Delayed preemption {}/{}: {}us", thread, id, delay);
        }

        Commands::Change {
            thread,
            id,
            priority,
            wcet,
            deadline,
        } => {
            let r = client
                .change(
                    thread,
                    id,
                    ChangeRequest {
                        priority,
                        wcet_us: wcet,
                        deadline_us: deadline,
                    },
                )
                .await?;
            println!(
                "Changed {}/{}: p={} C={} D={}",
                thread, id, r.priority, r.wcet_us, r.deadline_us
            );
        }

        Commands::DeleteThread { thread } => {
            let outcome = client.delete_thread(thread).await?;
            println!("Removed {} reservations", outcome.removed);
            if !outcome.kernel_consistent {
                eprintln!("warning: kernel did not drop every timeslice");
            }
        }

        Commands::DeleteTask { thread } => {
            let outcome = client.delete_task(thread).await?;
            println!("Removed {} reservations", outcome.removed);
            if !outcome.kernel_consistent {
                eprintln!("warning: kernel did not drop every timeslice");
            }
        }

        Commands::Begin { thread, clock, mode } => {
            client.begin_periodic(thread, mode.into(), clock).await?;
            println!("{} periodic from {}", thread, clock);
        }

        Commands::End { thread } => {
            client.end_periodic(thread).await?;
            println!("{} no longer periodic", thread);
        }

        Commands::Watch { thread } => {
            let reply = client.watch(thread).await?;
            println!(
                "Watching {} (preempter {}, {} counters)",
                thread, reply.preempter, reply.slots
            );
        }

        Commands::Counters { thread } => {
            let counters = client.watch_counters(thread).await?;
            for (id, count) in counters.iter().enumerate().filter(|(_, c)| **c != 0) {
                println!("  {:>4}: {}", id, count);
            }
        }

        Commands::TimeDemand { thread, id } => {
            let time = client.time_demand(thread, id).await?;
            println!("{}/{}: {}us", thread, id, time);
        }

        Commands::Granularity => {
            println!("{}us", client.granularity().await?);
        }
    }

    Ok(())
}
