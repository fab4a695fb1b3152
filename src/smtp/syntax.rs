//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Mailslot.
//
// Mailslot is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailslot is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even  the implied warranty  of MERCHANTABILITY  or
// FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailslot. If not, see <http://www.gnu.org/licenses/>.

//! Command-line and address syntax.
//!
//! Address parsing is deliberately permissive: a mailbox is anything of the
//! form `local@domain` where the local part contains neither `@` nor `>`.
//! Strict RFC 5321 mailbox grammar would reject real-world senders that the
//! rest of the ecosystem accepts.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// HELO hostname (the hostname may be empty; the dispatcher decides)
    Helo(String),
    /// EHLO hostname
    Ehlo(String),
    /// AUTH mechanism [initial-base64]
    Auth(String, Option<String>),
    /// MAIL with its raw arguments, parsed separately by `parse_mail_from`
    Mail(String),
    /// RCPT with its raw arguments, parsed separately by `parse_rcpt_to`
    Recipient(String),
    /// DATA
    Data,
    /// RSET
    Reset,
    /// VRFY ignored...
    Verify,
    /// NOOP ignored...
    Noop,
    /// QUIT
    Quit,
    /// STARTTLS
    StartTls,
}

static SIMPLE_COMMANDS: &[(&str, Command, bool)] = &[
    ("DATA", Command::Data, false),
    ("RSET", Command::Reset, false),
    ("VRFY", Command::Verify, true),
    ("NOOP", Command::Noop, true),
    ("QUIT", Command::Quit, false),
    ("STARTTLS", Command::StartTls, false),
];

lazy_static! {
    static ref RX_HELO: Regex =
        Regex::new("^(?i)(HELO|EHLO)(?: +(.*))?$").unwrap();
    static ref RX_MAIL: Regex =
        Regex::new("^(?i)MAIL(?: +(.*))?$").unwrap();
    static ref RX_RCPT: Regex =
        Regex::new("^(?i)RCPT(?: +(.*))?$").unwrap();
    static ref RX_AUTH: Regex =
        Regex::new("^(?i)AUTH +([A-Za-z0-9-]+)(?: +([^ ]+))?$").unwrap();
    static ref RX_MAIL_FROM: Regex =
        Regex::new(r"^(?i)from:\s*<([^@>]+)@([^@>]+)>( .*)?$").unwrap();
    static ref RX_MAIL_FROM_NULL: Regex =
        Regex::new(r"^(?i)from:\s*<>( .*)?$").unwrap();
    static ref RX_RCPT_TO: Regex =
        Regex::new(r"^(?i)to:\s*<([^@>]+)@([^@>]+)>$").unwrap();
    static ref RX_SIZE_PARAM: Regex =
        Regex::new("(?i)\\bSIZE=([0-9]+)\\b").unwrap();
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        for &(prefix, ref cmd, allow_trailing_garbage) in SIMPLE_COMMANDS {
            let matches_prefix = s
                .get(0..prefix.len())
                .is_some_and(|sp| prefix.eq_ignore_ascii_case(sp));
            if matches_prefix
                && (s.len() == prefix.len()
                    || (allow_trailing_garbage
                        && s.as_bytes()[prefix.len()] == b' '))
            {
                return Ok(cmd.clone());
            }
        }

        if let Some(captures) = RX_HELO.captures(s) {
            let host = captures
                .get(2)
                .map_or("", |m| m.as_str())
                .trim()
                .to_owned();
            return if captures[1].eq_ignore_ascii_case("HELO") {
                Ok(Command::Helo(host))
            } else {
                Ok(Command::Ehlo(host))
            };
        }

        if let Some(captures) = RX_AUTH.captures(s) {
            return Ok(Command::Auth(
                captures[1].to_owned(),
                captures.get(2).map(|m| m.as_str().to_owned()),
            ));
        }

        if let Some(captures) = RX_MAIL.captures(s) {
            return Ok(Command::Mail(
                captures.get(1).map_or("", |m| m.as_str()).to_owned(),
            ));
        }

        if let Some(captures) = RX_RCPT.captures(s) {
            return Ok(Command::Recipient(
                captures.get(1).map_or("", |m| m.as_str()).to_owned(),
            ));
        }

        Err(())
    }
}

/// A parsed mailbox.
///
/// The domain is lower-cased on construction; the local part is preserved
/// verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub local: String,
    pub domain: String,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

/// The return path given to MAIL, which may be the null path `<>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReversePath {
    Null,
    Mailbox(Address),
}

/// Parses the arguments of a MAIL command.
///
/// Returns the return path and any `SIZE=` parameter, or `None` if the
/// arguments don't look like a sender declaration at all.
pub fn parse_mail_from(args: &str) -> Option<(ReversePath, Option<u64>)> {
    if let Some(captures) = RX_MAIL_FROM.captures(args) {
        let address = Address {
            local: captures[1].to_owned(),
            domain: captures[2].to_ascii_lowercase(),
        };
        Some((
            ReversePath::Mailbox(address),
            size_parameter(captures.get(3).map_or("", |m| m.as_str())),
        ))
    } else if let Some(captures) = RX_MAIL_FROM_NULL.captures(args) {
        Some((
            ReversePath::Null,
            size_parameter(captures.get(1).map_or("", |m| m.as_str())),
        ))
    } else {
        None
    }
}

/// Parses the arguments of a RCPT command.
///
/// Unlike MAIL, the null path is not permitted and no trailing parameters
/// are accepted.
pub fn parse_rcpt_to(args: &str) -> Option<Address> {
    RX_RCPT_TO.captures(args).map(|captures| Address {
        local: captures[1].to_owned(),
        domain: captures[2].to_ascii_lowercase(),
    })
}

fn size_parameter(params: &str) -> Option<u64> {
    RX_SIZE_PARAM
        .captures(params)
        .and_then(|captures| captures[1].parse().ok())
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(s: &str) -> Command {
        s.parse::<Command>().unwrap()
    }

    #[test]
    fn simple_commands() {
        assert_eq!(Command::Data, parse("DATA"));
        assert_eq!(Command::Reset, parse("rset"));
        assert_eq!(Command::Quit, parse("Quit"));
        assert_eq!(Command::StartTls, parse("STARTTLS"));
        assert_eq!(Command::Verify, parse("VRFY"));
        assert_eq!(Command::Verify, parse("VRFY somebody"));
        assert_eq!(Command::Noop, parse("NOOP"));
        assert_eq!(Command::Noop, parse("NOOP whatever"));

        // Trailing garbage is not tolerated on state-changing commands
        assert!("DATA NOW".parse::<Command>().is_err());
        assert!("QUITX".parse::<Command>().is_err());
        assert!("WHAT".parse::<Command>().is_err());
        assert!("X".parse::<Command>().is_err());
    }

    #[test]
    fn helo_and_ehlo() {
        assert_eq!(
            Command::Helo("mail.example.com".to_owned()),
            parse("HELO mail.example.com"),
        );
        assert_eq!(
            Command::Ehlo("mail.example.com".to_owned()),
            parse("ehlo mail.example.com"),
        );
        assert_eq!(Command::Ehlo(String::new()), parse("EHLO"));
        assert_eq!(Command::Helo(String::new()), parse("HELO "));
    }

    #[test]
    fn auth_command() {
        assert_eq!(
            Command::Auth("PLAIN".to_owned(), None),
            parse("AUTH PLAIN"),
        );
        assert_eq!(
            Command::Auth(
                "plain".to_owned(),
                Some("AGFsaWNlAHNlY3JldA==".to_owned()),
            ),
            parse("AUTH plain AGFsaWNlAHNlY3JldA=="),
        );
        assert_eq!(
            Command::Auth("XOAUTH2".to_owned(), None),
            parse("auth XOAUTH2"),
        );
        assert!("AUTH".parse::<Command>().is_err());
    }

    #[test]
    fn mail_from_parsing() {
        assert_eq!(
            Some((
                ReversePath::Mailbox(Address {
                    local: "Alice".to_owned(),
                    domain: "example.com".to_owned(),
                }),
                None,
            )),
            parse_mail_from("FROM:<Alice@EXAMPLE.COM>"),
        );
        assert_eq!(
            Some((ReversePath::Null, None)),
            parse_mail_from("from:<>"),
        );
        assert_eq!(
            Some((ReversePath::Null, Some(1024))),
            parse_mail_from("FROM:<> SIZE=1024"),
        );
        assert_eq!(
            Some((
                ReversePath::Mailbox(Address {
                    local: "a".to_owned(),
                    domain: "b.com".to_owned(),
                }),
                Some(42),
            )),
            parse_mail_from("FROM: <a@b.com> BODY=8BITMIME SIZE=42"),
        );

        assert_eq!(None, parse_mail_from("FROM:a@b.com"));
        assert_eq!(None, parse_mail_from("FROM:<@b.com>"));
        assert_eq!(None, parse_mail_from("FROM:<a@>"));
        assert_eq!(None, parse_mail_from("FROM:<a@b@c>"));
        assert_eq!(None, parse_mail_from(""));
    }

    #[test]
    fn rcpt_to_parsing() {
        assert_eq!(
            Some(Address {
                local: "X".to_owned(),
                domain: "y.com".to_owned(),
            }),
            parse_rcpt_to("TO:<X@Y.COM>"),
        );
        assert_eq!(
            Some(Address {
                local: "c".to_owned(),
                domain: "d.com".to_owned(),
            }),
            parse_rcpt_to("to: <c@d.com>"),
        );

        // Null paths and trailing parameters are sender-only liberties.
        assert_eq!(None, parse_rcpt_to("TO:<>"));
        assert_eq!(None, parse_rcpt_to("TO:<c@d.com> NOTIFY=NEVER"));
        assert_eq!(None, parse_rcpt_to("c@d.com"));
    }

    #[test]
    fn local_part_preserved_verbatim() {
        let (path, _) =
            parse_mail_from("FROM:<MixedCase+tag@Example.Org>").unwrap();
        assert_eq!(
            ReversePath::Mailbox(Address {
                local: "MixedCase+tag".to_owned(),
                domain: "example.org".to_owned(),
            }),
            path,
        );
    }
}
