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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement.
///
/// Clones of a `LogPrefix` share the same underlying data, so a prefix
/// enriched mid-session (HELO host, authenticated user) updates everywhere
/// at once.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    connection: String,
    helo: Option<String>,
    user: Option<String>,
}

impl LogPrefix {
    pub fn new(connection: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                connection,
                helo: None,
                user: None,
            })),
        }
    }

    pub fn set_helo(&self, helo: String) {
        self.inner.lock().unwrap().helo = Some(helo);
    }

    pub fn set_user(&self, user: String) {
        self.inner.lock().unwrap().user = Some(user);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.connection)?;
        if inner.helo.is_some() || inner.user.is_some() {
            write!(f, "[{}", inner.helo.as_deref().unwrap_or("<no-helo>"))?;
            if let Some(ref user) = inner.user {
                write!(f, " {}", user)?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_grows_as_session_progresses() {
        let prefix = LogPrefix::new("smtp:192.0.2.9".to_owned());
        assert_eq!("smtp:192.0.2.9", prefix.to_string());

        let clone = prefix.clone();
        prefix.set_helo("client.example".to_owned());
        assert_eq!("smtp:192.0.2.9[client.example]", clone.to_string());

        prefix.set_user("alice".to_owned());
        assert_eq!("smtp:192.0.2.9[client.example alice]", clone.to_string());
    }
}
