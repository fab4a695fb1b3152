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

//! Thin wrapper around the MX resolution used by address validation.

use hickory_resolver::error::ResolveErrorKind;
pub use hickory_resolver::Name;

pub type Resolver = hickory_resolver::AsyncResolver<
    hickory_resolver::name_server::GenericConnector<
        hickory_resolver::name_server::TokioRuntimeProvider,
    >,
>;

/// Creates a resolver from the system DNS configuration.
pub fn system_resolver(
) -> Result<Resolver, hickory_resolver::error::ResolveError> {
    Resolver::tokio_from_system_conf()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MxError {
    /// The lookup succeeded but the domain has no MX records.
    NotFound,
    /// The lookup itself failed.
    Failed,
}

/// Resolves the MX exchanges for `domain`, ordered as returned.
pub async fn look_up_mx(
    resolver: &Resolver,
    domain: &str,
) -> Result<Vec<Name>, MxError> {
    match resolver.mx_lookup(domain).await {
        Ok(lookup) => {
            let exchanges: Vec<Name> =
                lookup.iter().map(|mx| mx.exchange().clone()).collect();
            if exchanges.is_empty() {
                Err(MxError::NotFound)
            } else {
                Ok(exchanges)
            }
        },

        Err(e) => match e.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => Err(MxError::NotFound),
            _ => Err(MxError::Failed),
        },
    }
}
