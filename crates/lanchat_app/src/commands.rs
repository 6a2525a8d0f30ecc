//! Parsing of the lines typed at the `lanchat` prompt.

use anyhow::{bail, Context, Result};

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List discovered peers with their index.
    Peers,
    /// Open a session to the peer at the given 1-based index.
    Connect(usize),
    /// Close the session to the peer at the given 1-based index.
    Disconnect(usize),
    /// Multicast a discovery request.
    Discover,
    /// Ask connected peers to identify themselves.
    Who,
    /// Send a chat message to one peer.
    Msg { index: usize, text: String },
    /// Broadcast a raw text frame.
    Raw(String),
    Help,
    Quit,
    /// Broadcast a chat message.
    Say(String),
    /// Blank line.
    Nothing,
}

pub const HELP: &str = "\
/peers               list discovered peers
/connect <n>         open a session to peer n
/disconnect <n>      close the session to peer n
/discover            ask the LAN who is there
/who                 ask connected peers to identify themselves
/msg <n> <text>      send a message to peer n only
/raw <text>          broadcast a raw text frame
/quit                leave
anything else        broadcast a chat message";

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Nothing);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Say(line.to_string()));
        };

        let (verb, args) = match rest.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (rest, ""),
        };

        match verb {
            "peers" => Ok(Self::Peers),
            "connect" => Ok(Self::Connect(parse_index(args)?)),
            "disconnect" => Ok(Self::Disconnect(parse_index(args)?)),
            "discover" => Ok(Self::Discover),
            "who" => Ok(Self::Who),
            "msg" => {
                let (index, text) = args
                    .split_once(char::is_whitespace)
                    .context("usage: /msg <n> <text>")?;
                let text = text.trim();
                if text.is_empty() {
                    bail!("usage: /msg <n> <text>");
                }
                Ok(Self::Msg {
                    index: parse_index(index)?,
                    text: text.to_string(),
                })
            }
            "raw" => {
                if args.is_empty() {
                    bail!("usage: /raw <text>");
                }
                Ok(Self::Raw(args.to_string()))
            }
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => bail!("unknown command '/{other}', try /help"),
        }
    }
}

fn parse_index(arg: &str) -> Result<usize> {
    let index: usize = arg
        .parse()
        .with_context(|| format!("expected a peer number, got '{arg}'"))?;
    if index == 0 {
        bail!("peer numbers start at 1");
    }
    Ok(index)
}
