//! Chat peer
//!
//! Line-oriented adapter over `PeerClient`. Reads commands from stdin and
//! prints events as they arrive.
//!
//! Usage: chat-peer --user <name> [--password <pw>] [--register]
//!                  [--server <addr:port>] [--bind-ip <ip>] [--advertise <ip>]...
//!                  [--handshake-timeout-secs <n>]

use std::io::{self, BufRead, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use peer_link::events::PeerEvents;
use peer_link::negotiator::{TcpRendezvous, DEFAULT_HANDSHAKE_TIMEOUT};
use peer_link::transport::TransportKind;
use peer_link::{PeerClient, PeerOptions, ServerConnection};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

/// Default relay server
const DEFAULT_SERVER: &str = "127.0.0.1:9000";

/// How long to wait for the TCP connection to the server
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Console Events
// ============================================================================

/// Prints events to stdout
struct ConsoleEvents;

impl ConsoleEvents {
    fn print(&self, line: std::fmt::Arguments<'_>) {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }
}

impl PeerEvents for ConsoleEvents {
    fn offer_received(&self, peer: &str, deadline: Instant) {
        let secs = deadline.saturating_duration_since(Instant::now()).as_secs();
        self.print(format_args!(
            "* {} wants a direct link. /accept {} or /reject {} (expires in {}s)",
            peer, peer, peer, secs
        ));
    }

    fn ready(&self, peer: &str) {
        self.print(format_args!("* Direct link to {} is up", peer));
    }

    fn rejected(&self, peer: &str) {
        self.print(format_args!("* {} declined the direct link", peer));
    }

    fn timed_out(&self, peer: &str) {
        self.print(format_args!("* Direct link with {} timed out", peer));
    }

    fn transport_error(&self, peer: &str, reason: &str) {
        self.print(format_args!("* Direct link with {} failed ({}), using relay", peer, reason));
    }

    fn message(&self, from: &str, content: &str, via: TransportKind) {
        match via {
            TransportKind::Direct => self.print(format_args!("[{} ⇄] {}", from, content)),
            TransportKind::Relay => self.print(format_args!("[{}] {}", from, content)),
        }
    }

    fn user_list(&self, users: &[String]) {
        self.print(format_args!("* Online: {}", users.join(", ")));
    }

    fn server_error(&self, message: &str, peer: Option<&str>) {
        match peer {
            Some(peer) => self.print(format_args!("! {} ({})", message, peer)),
            None => self.print(format_args!("! {}", message)),
        }
    }

    fn disconnected(&self) {
        self.print(format_args!("! Disconnected from server"));
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn"),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();

    let server: SocketAddr = parse_arg(&args, "--server")
        .unwrap_or_else(|| DEFAULT_SERVER.to_string())
        .parse()
        .map_err(|_| "Invalid server address")?;
    let user = parse_arg(&args, "--user").ok_or("--user is required")?;
    let password = match parse_arg(&args, "--password") {
        Some(password) => password,
        None => prompt("Password: ")?,
    };
    let bind_ip: IpAddr = match parse_arg(&args, "--bind-ip") {
        Some(ip) => ip.parse().map_err(|_| "Invalid bind IP")?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let advertise = parse_all(&args, "--advertise")
        .iter()
        .map(|ip| ip.parse::<IpAddr>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| "Invalid advertise address")?;
    let handshake_timeout = match parse_arg(&args, "--handshake-timeout-secs") {
        Some(secs) => Duration::from_secs(secs.parse().map_err(|_| "Invalid handshake timeout")?),
        None => DEFAULT_HANDSHAKE_TIMEOUT,
    };

    log::info!("Chat peer starting...");
    log::info!("  Server:    {}", server);
    log::info!("  User:      {}", user);
    log::info!("  Bind IP:   {}", bind_ip);
    log::info!("  Handshake: {}s", handshake_timeout.as_secs());

    let connection = ServerConnection::connect(server, CONNECT_TIMEOUT)?;
    if args.iter().any(|a| a == "--register") {
        connection.register(&user, &password)?;
        println!("* Registered {}", user);
    }

    let mut options = PeerOptions::new(
        Arc::new(TcpRendezvous::new(bind_ip, advertise)),
        Arc::new(ConsoleEvents),
    );
    options.handshake_timeout = handshake_timeout;
    let client = connection.login(&user, &password, options)?;
    println!("* Logged in as {}. Type /help for commands.", user);

    // SIGINT/SIGTERM close every link before exit
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let on_signal = client.clone();
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if signals.forever().next().is_some() {
                on_signal.shutdown();
                std::process::exit(0);
            }
        })?;

    client.request_user_list()?;
    run_commands(&client, io::stdin().lock());
    client.shutdown();
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Every value of a repeatable flag
fn parse_all(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].clone())
        .collect()
}

fn prompt(label: &str) -> io::Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end().to_string())
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    List,
    Direct(&'a str),
    Accept(&'a str),
    Reject(&'a str),
    Close(&'a str),
    Status(&'a str),
    Send { to: &'a str, content: &'a str },
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Command<'_>, String> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix('@') {
        let (to, content) = rest.split_once(' ').ok_or("usage: @user message")?;
        let content = content.trim();
        if to.is_empty() || content.is_empty() {
            return Err("usage: @user message".to_string());
        }
        return Ok(Command::Send { to, content });
    }

    let mut words = line.split_whitespace();
    let name = words.next().unwrap_or("");
    match name {
        "/list" => return Ok(Command::List),
        "/help" => return Ok(Command::Help),
        "/quit" | "/exit" => return Ok(Command::Quit),
        "/p2p" | "/accept" | "/reject" | "/close" | "/status" => {}
        _ => return Err(format!("unknown command '{}', try /help", name)),
    }

    let peer = words
        .next()
        .ok_or_else(|| format!("usage: {} <user>", name))?;
    Ok(match name {
        "/p2p" => Command::Direct(peer),
        "/accept" => Command::Accept(peer),
        "/reject" => Command::Reject(peer),
        "/close" => Command::Close(peer),
        _ => Command::Status(peer),
    })
}

fn run_commands(client: &PeerClient, input: impl BufRead) {
    for line in input.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let result = match parse_command(&line) {
            Ok(Command::List) => client.request_user_list(),
            Ok(Command::Direct(peer)) => client.initiate(peer),
            Ok(Command::Accept(peer)) => client.accept(peer),
            Ok(Command::Reject(peer)) => client.reject(peer),
            Ok(Command::Close(peer)) => client.close_direct(peer),
            Ok(Command::Status(peer)) => {
                let via = client
                    .transport_kind(peer)
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                println!("* {}: {} via {}", peer, client.session_state(peer), via);
                Ok(())
            }
            Ok(Command::Send { to, content }) => client.send(to, content).map(|_| ()),
            Ok(Command::Help) => {
                print_help();
                Ok(())
            }
            Ok(Command::Quit) => break,
            Err(usage) => {
                println!("! {}", usage);
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("! {}", e);
        }
        if !client.is_connected() {
            break;
        }
    }
}

fn print_help() {
    println!("  @user message     Send a message");
    println!("  /list             Show who is online");
    println!("  /p2p <user>       Offer a direct link");
    println!("  /accept <user>    Accept a direct link offer");
    println!("  /reject <user>    Decline a direct link offer");
    println!("  /close <user>     Drop a direct link, back to relay");
    println!("  /status <user>    Show link state");
    println!("  /quit             Leave");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("/list"), Ok(Command::List));
        assert_eq!(parse_command("  /p2p bob "), Ok(Command::Direct("bob")));
        assert_eq!(parse_command("/accept alice"), Ok(Command::Accept("alice")));
        assert_eq!(
            parse_command("@bob hello there"),
            Ok(Command::Send {
                to: "bob",
                content: "hello there"
            })
        );
        assert_eq!(parse_command("/quit"), Ok(Command::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("/p2p").is_err());
        assert!(parse_command("@bob").is_err());
        assert!(parse_command("@ hi").is_err());
        assert!(parse_command("/dance").is_err());
    }

    #[test]
    fn test_repeatable_flag() {
        let args: Vec<String> = ["chat-peer", "--advertise", "10.0.0.1", "--user", "a", "--advertise", "10.0.0.2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(parse_all(&args, "--advertise"), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(parse_arg(&args, "--user"), Some("a".to_string()));
    }
}
