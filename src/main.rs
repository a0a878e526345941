use clap::{Parser, Subcommand};
use roomcall_lib::{logger, utils, Command, Config};

#[derive(Parser)]
#[command(name = "roomcall", about = "Two-party WebRTC call through a signaling relay")]
struct Cli {
    /// Адрес сервиса комнат (SERVER_URL)
    #[arg(long)]
    server: Option<String>,

    /// Адрес сигнального relay (SIGNALING_URL)
    #[arg(long)]
    signaling: Option<String>,

    /// Имя участника, по умолчанию USER-<n>
    #[arg(long)]
    name: Option<String>,

    /// Только TURN relay кандидаты
    #[arg(long)]
    relay_only: bool,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Создать комнату и ждать собеседника
    Host {
        #[arg(long)]
        password: String,
    },
    /// Войти в существующую комнату
    Join {
        #[arg(long)]
        room: String,
        #[arg(long)]
        password: String,
    },
}

#[tokio::main]
async fn main() {
    logger::init();
    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };
    if let Some(server) = cli.server {
        config.signaling_url = utils::websocket_url(&server);
        config.server_url = server;
    }
    if let Some(signaling) = cli.signaling {
        config.signaling_url = signaling;
    }
    if cli.relay_only {
        config.negotiation.relay_only = true;
    }

    let command = match cli.command {
        Action::Host { password } => Command::Host { password },
        Action::Join { room, password } => Command::Join {
            room_id: room,
            password,
        },
    };
    let name = cli.name.unwrap_or_else(utils::display_name);

    match roomcall_lib::run(config, command, name).await {
        Ok(report) if report.error.is_none() => {}
        Ok(report) => {
            if let Some(e) = report.error {
                eprintln!("{}: {e}", e.kind());
            }
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("{}: {e}", e.kind());
            std::process::exit(1);
        }
    }
}
