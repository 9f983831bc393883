use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use chatmesh_peer::{ChatEndReason, EventReceiver, PeerConfig, PeerError, PeerEvent, PeerNode, SessionState};

const HELP: &str = "\
/register <user> <password>   create an account
/login <user> <password>      log in
/peers                        who is online
/chat <user>                  ask someone for a private chat
/invites                      pending chat requests
/accept <n> | /refuse <n>     answer request number n
/rooms | /myrooms             all rooms | rooms you moderate
/create <room>                create a room
/join <room>                  join a room you are a member of
/members <room>               list a room's members
/add <room> <user>            add a member (moderator only)
/remove <room> <user>         remove a member (moderator only)
/close <room>                 close a room (moderator only)
/exit                         leave the current chat or room
/logout | /quit
anything else is sent to the current chat or room";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chatmesh_peer=debug")),
        )
        .init();

    info!("Starting chatmesh peer v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Connect to the tracker and start listening for peers
    // -----------------------------------------------------------------------
    let config = PeerConfig::from_env();
    let (node, events) = PeerNode::start(config).await?;
    tokio::spawn(print_events(events));

    println!("Connected. Listening for peers on port {}. Type /help.", node.listen_port());

    // -----------------------------------------------------------------------
    // 3. Read commands until /quit, EOF or Ctrl+C
    // -----------------------------------------------------------------------
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                None
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(e) = run_command(&node, line).await {
            println!("! {e}");
        }
    }

    node.shutdown().await;
    Ok(())
}

async fn run_command(node: &Arc<PeerNode>, line: &str) -> Result<(), PeerError> {
    if !line.starts_with('/') {
        return node.send_text(line).await;
    }

    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();

    match (command, args.as_slice()) {
        ("/help", _) => println!("{HELP}"),
        ("/register", [user, password]) => println!("{}", node.register(user, password).await?),
        ("/login", [user, password]) => {
            let user = node.login(user, password).await?;
            println!("Logged in as {user}");
        }
        ("/logout", []) => {
            node.logout().await?;
            println!("Logged out");
        }
        ("/peers", []) => print_list("Online", &node.list_peers().await?),
        ("/chat", [user]) => {
            // The answer can take a while; keep reading commands meanwhile.
            let node = node.clone();
            let target = user.to_string();
            println!("Waiting for {target} to answer...");
            tokio::spawn(async move {
                if let Err(e) = node.request_chat(&target).await {
                    println!("! {e}");
                }
            });
        }
        ("/invites", []) => {
            let pending = node.pending_invitations().await;
            if pending.is_empty() {
                println!("No pending chat requests");
            }
            for (i, from) in pending.iter().enumerate() {
                println!("  {}. {from}", i + 1);
            }
        }
        ("/accept" | "/refuse", [n]) => {
            let index = parse_index(n)?;
            let answer = command.trim_start_matches('/');
            let from = node.respond_to_invitation(index, answer).await?;
            println!("Answered {from}: {answer}");
        }
        ("/rooms", []) => print_list("Rooms", &node.list_rooms().await?),
        ("/myrooms", []) => print_list("Your rooms", &node.list_my_rooms().await?),
        ("/create", [room]) => println!("{}", node.create_room(room).await?),
        ("/join", [room]) => {
            let connected = node.join_room(room).await?;
            println!("Joined {room}, connected to {connected} member(s)");
        }
        ("/members", [room]) => {
            let (moderator, members) = node.list_members(room).await?;
            println!("Moderator: {moderator}");
            print_list("Members", &members);
        }
        ("/add", [room, user]) => println!("{}", node.add_member(room, user).await?),
        ("/remove", [room, user]) => println!("{}", node.remove_member(room, user).await?),
        ("/close", [room]) => println!("{}", node.close_room(room).await?),
        ("/exit", []) => match node.state() {
            SessionState::Chatting { .. } => node.end_chat().await?,
            SessionState::InRoom { room } => {
                node.leave_room().await;
                println!("Left {room}");
            }
            state => println!("Nothing to leave while {state}"),
        },
        _ => println!("Unknown command or wrong arguments. Type /help."),
    }
    Ok(())
}

/// `/accept 1` means the first invitation.
fn parse_index(raw: &str) -> Result<usize, PeerError> {
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n - 1),
        _ => Err(PeerError::InvalidSelection(format!("'{raw}' is not a request number"))),
    }
}

fn print_list(title: &str, items: &[String]) {
    if items.is_empty() {
        println!("{title}: none");
    } else {
        println!("{title}: {}", items.join(", "));
    }
}

async fn print_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::InvitationReceived { from } => {
                println!("* {from} wants to chat. See /invites.");
            }
            PeerEvent::InvitationExpired { from } => println!("* Request from {from} expired"),
            PeerEvent::ChatStarted { peer } => {
                println!("* Chatting with {peer}. Type /exit to leave.");
            }
            PeerEvent::ChatMessage { from, content } => println!("[{from}] {content}"),
            PeerEvent::ChatEnded { peer, reason } => match reason {
                ChatEndReason::LocalExit => println!("* You left the chat with {peer}"),
                ChatEndReason::RemoteExit => println!("* {peer} left the chat"),
                ChatEndReason::ConnectionLost => println!("* Lost connection to {peer}"),
            },
            PeerEvent::GroupMemberJoined { user } => println!("* {user} joined the room"),
            PeerEvent::GroupMemberLeft { user } => println!("* {user} left the room"),
            PeerEvent::GroupMessage { from, content } => println!("<{from}> {content}"),
            PeerEvent::TrackerLost { reason } => println!("! Tracker unreachable: {reason}"),
        }
    }
}
