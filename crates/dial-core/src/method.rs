use smol_str::SmolStr;

/// SIP request methods understood by the client stack.
///
/// Extension methods parse into [`Method::Extension`] so the transaction
/// layer can still match them by token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Message,
    Info,
    Update,
    Refer,
    Extension(SmolStr),
}

impl Method {
    /// Returns the canonical uppercase token for this method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Message => "MESSAGE",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Refer => "REFER",
            Method::Extension(token) => token.as_str(),
        }
    }

    /// Parses a method token, case-insensitively for the known set.
    ///
    /// Unknown tokens are preserved verbatim as [`Method::Extension`].
    pub fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("INVITE") {
            Method::Invite
        } else if token.eq_ignore_ascii_case("ACK") {
            Method::Ack
        } else if token.eq_ignore_ascii_case("BYE") {
            Method::Bye
        } else if token.eq_ignore_ascii_case("CANCEL") {
            Method::Cancel
        } else if token.eq_ignore_ascii_case("REGISTER") {
            Method::Register
        } else if token.eq_ignore_ascii_case("OPTIONS") {
            Method::Options
        } else if token.eq_ignore_ascii_case("MESSAGE") {
            Method::Message
        } else if token.eq_ignore_ascii_case("INFO") {
            Method::Info
        } else if token.eq_ignore_ascii_case("UPDATE") {
            Method::Update
        } else if token.eq_ignore_ascii_case("REFER") {
            Method::Refer
        } else {
            Method::Extension(SmolStr::new(token))
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_methods_case_insensitively() {
        assert_eq!(Method::from_token("invite"), Method::Invite);
        assert_eq!(Method::from_token("REGISTER"), Method::Register);
        assert_eq!(Method::from_token("Bye"), Method::Bye);
    }

    #[test]
    fn preserves_extension_tokens() {
        let m = Method::from_token("SNAPSHOT");
        assert_eq!(m, Method::Extension(SmolStr::new("SNAPSHOT")));
        assert_eq!(m.as_str(), "SNAPSHOT");
    }

    #[test]
    fn round_trips_canonical_tokens() {
        for token in ["INVITE", "ACK", "BYE", "CANCEL", "REGISTER", "OPTIONS", "MESSAGE"] {
            assert_eq!(Method::from_token(token).as_str(), token);
        }
    }
}
