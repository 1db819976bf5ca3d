//! Operator console: the On/Off/Restart buttons and the log panel, on stdin/stdout.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};

use rust_tokio_server::{Server, ServerConfig, ServerEvent, init_logger};

// How many event lines the `log` command keeps around
const HISTORY_LINES: usize = 500;

const HELP: &str = "\
commands:
  on [port]   start the server (default: configured port)
  off         stop the server
  restart     stop, then start on the last port
  status      show state, address and client count
  clients     list connected clients
  log         show recent events
  help        show this text
  quit        stop the server and exit";

fn main() {
    // Optional first argument: path to a JSON config file
    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::from_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(2);
            }
        },
        None => ServerConfig::default(),
    };

    let logger = init_logger("rust_tokio_server", &config.logger);

    // The "log panel": every event as a `[hh:mm:ss]: message` line
    let history: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
    let panel = history.clone();
    let server = Server::with_observer(config, move |event: &ServerEvent| {
        let mut lines = panel.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == HISTORY_LINES {
            lines.pop_front();
        }
        lines.push_back(event.to_line());
    });

    println!("{}", HELP);
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                logger.error(&format!("Failed to read command: {}", e));
                break;
            }
        };

        let mut words = line.split_whitespace();
        match words.next() {
            Some("on") => {
                let port = match words.next().map(str::parse::<u16>) {
                    None => server.config().port,
                    Some(Ok(port)) => port,
                    Some(Err(e)) => {
                        println!("invalid port: {}", e);
                        continue;
                    }
                };
                match server.start(port) {
                    Ok(()) => println!("Server is turned on."),
                    Err(e) => println!("start failed: {}", e),
                }
            }
            Some("off") => match server.stop() {
                Ok(()) => println!("Server is turned off."),
                Err(e) => println!("stop finished with error: {}", e),
            },
            Some("restart") => match server.restart() {
                Ok(()) => println!("Server is restarted."),
                Err(e) => println!("restart failed: {}", e),
            },
            Some("status") => {
                let addr = server
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "state: {}, address: {}, clients: {}",
                    server.state(),
                    addr,
                    server.connection_count()
                );
            }
            Some("clients") => {
                for info in server.connections() {
                    println!(
                        "{} {} since {}",
                        info.id,
                        info.peer,
                        info.connected_at.format("%H:%M:%S")
                    );
                }
            }
            Some("log") => {
                let lines = history.lock().unwrap_or_else(PoisonError::into_inner);
                for entry in lines.iter() {
                    println!("{}", entry);
                }
            }
            Some("help") => println!("{}", HELP),
            Some("quit") | Some("exit") => break,
            Some(other) => println!("unknown command '{}', try 'help'", other),
            None => {}
        }
        let _ = io::stdout().flush();
    }

    if let Err(e) = server.stop() {
        logger.warn(&format!("Stop on exit failed: {}", e));
    }
}
