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

//! Sender/recipient acceptance checks for MAIL and RCPT.

use std::borrow::Cow;

use log::{info, warn};

use super::codes::*;
use super::envelope::Envelope;
use super::hooks::{Hooks, SmtpResponse};
use crate::config::ServerConfig;
use crate::support::dns;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum AddressKind {
    Sender,
    Recipient,
}

impl AddressKind {
    fn noun(self) -> &'static str {
        match self {
            AddressKind::Sender => "Sender",
            AddressKind::Recipient => "Recipient",
        }
    }

    fn table(self) -> &'static str {
        match self {
            AddressKind::Sender => "sender",
            AddressKind::Recipient => "recipient",
        }
    }
}

/// Decides whether `email` is acceptable in the `kind` role.
///
/// First the domain must resolve to at least one MX exchange (skipped when
/// DNS validation is disabled or no resolver was built), then the embedder's
/// matching validation hook, if any, gets a veto. The returned error is the
/// reply to send; the transaction state is untouched either way.
pub(super) async fn validate_address(
    kind: AddressKind,
    email: &str,
    domain: &str,
    envelope: &Envelope,
    config: &ServerConfig,
    hooks: &Hooks,
    resolver: Option<&dns::Resolver>,
) -> Result<(), SmtpResponse<'static>> {
    if !config.disable_dns_validation {
        if let Some(resolver) = resolver {
            if let Err(e) = dns::look_up_mx(resolver, domain).await {
                warn!(
                    "MX validation failed for {} <{}>: {:?}",
                    kind.table(),
                    email,
                    e,
                );

                let failed_hook = match kind {
                    AddressKind::Sender => {
                        hooks.sender_validation_failed.as_ref()
                    },
                    AddressKind::Recipient => {
                        hooks.recipient_validation_failed.as_ref()
                    },
                };
                if let Some(failed_hook) = failed_hook {
                    failed_hook(email);
                }

                return Err(SmtpResponse(
                    pc::ActionNotTakenTemporary,
                    Some((cc::TempFail, sc::BadSenderSystemAddress)),
                    Cow::Owned(format!(
                        "<{}>: {} address rejected: Domain not found",
                        email,
                        kind.noun(),
                    )),
                ));
            }
        }
    }

    let hook = match kind {
        AddressKind::Sender => hooks.validate_sender.as_ref(),
        AddressKind::Recipient => hooks.validate_recipient.as_ref(),
    };
    if let Some(hook) = hook {
        if let Err(rejection) = hook(envelope, email).await {
            info!(
                "Embedder rejected {} <{}>: {}",
                kind.table(),
                email,
                rejection.message,
            );
            return Err(rejection.response.unwrap_or_else(|| {
                SmtpResponse(
                    pc::ActionNotTakenPermanent,
                    Some((cc::PermFail, sc::BadDestinationMailboxAddress)),
                    Cow::Owned(format!(
                        "<{}>: {} address rejected: \
                         User unknown in local {} table",
                        email,
                        kind.noun(),
                        kind.table(),
                    )),
                )
            }));
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use futures::FutureExt;

    use super::*;
    use crate::smtp::hooks::Rejection;

    fn run(
        kind: AddressKind,
        email: &str,
        domain: &str,
        hooks: &Hooks,
    ) -> Result<(), SmtpResponse<'static>> {
        let config = ServerConfig {
            disable_dns_validation: true,
            ..ServerConfig::default()
        };
        let envelope = Envelope::new("192.0.2.9".parse().unwrap());
        futures::executor::block_on(validate_address(
            kind, email, domain, &envelope, &config, hooks, None,
        ))
    }

    #[test]
    fn accepts_without_hooks() {
        assert!(run(
            AddressKind::Sender,
            "a@b.com",
            "b.com",
            &Hooks::default(),
        )
        .is_ok());
    }

    #[test]
    fn hook_veto_uses_default_reply() {
        let hooks = Hooks {
            validate_recipient: Some(Box::new(|_, _| {
                async { Err(Rejection::new("nope")) }.boxed()
            })),
            ..Hooks::default()
        };

        let response =
            run(AddressKind::Recipient, "x@y.com", "y.com", &hooks)
                .unwrap_err();
        assert_eq!(pc::ActionNotTakenPermanent, response.0);
        assert_eq!(
            "<x@y.com>: Recipient address rejected: \
             User unknown in local recipient table",
            response.2,
        );
    }

    #[test]
    fn hook_veto_response_overrides_default() {
        let hooks = Hooks {
            validate_sender: Some(Box::new(|_, _| {
                async {
                    Err(Rejection::with_response(SmtpResponse(
                        pc::ActionNotTakenTemporary,
                        Some((cc::TempFail, sc::OtherMailSystem)),
                        Cow::Borrowed("try later"),
                    )))
                }
                .boxed()
            })),
            ..Hooks::default()
        };

        let response =
            run(AddressKind::Sender, "a@b.com", "b.com", &hooks).unwrap_err();
        assert_eq!(pc::ActionNotTakenTemporary, response.0);
        assert_eq!("try later", response.2);
    }

    #[test]
    fn hook_sees_the_address() {
        let hooks = Hooks {
            validate_sender: Some(Box::new(|envelope, email| {
                assert_eq!("192.0.2.9", envelope.remote_address.to_string());
                let ok = "a@b.com" == email;
                async move {
                    if ok {
                        Ok(())
                    } else {
                        Err(Rejection::new("wrong address"))
                    }
                }
                .boxed()
            })),
            ..Hooks::default()
        };

        assert!(run(AddressKind::Sender, "a@b.com", "b.com", &hooks).is_ok());
    }
}
