//! PPP authentication: CHAP-MD5 responder and PAP authenticator.

use std::time::{Duration, Instant};

use md5::{Digest, Md5};

/// CHAP packet codes.
const CHAP_CHALLENGE: u8 = 1;
const CHAP_RESPONSE: u8 = 2;
const CHAP_SUCCESS: u8 = 3;
const CHAP_FAILURE: u8 = 4;

const CHAP_HEADER_SZ: usize = 4;

/// PAP packet codes.
const PAP_REQUEST: u8 = 1;
const PAP_ACK: u8 = 2;
const PAP_NAK: u8 = 3;

/// RFC 1334 2.1.1: the Authenticate-Request is repeated until a valid
/// reply arrives or the retry counter expires.
const PAP_MAX_RETRY: u32 = 3;
const PAP_TIMEOUT: Duration = Duration::from_secs(10);

/// What an incoming authentication packet amounted to.
pub struct AuthOutcome {
    /// A packet to transmit under the authentication protocol.
    pub response: Option<Vec<u8>>,
    /// Final verdict, when the exchange concluded.
    pub result: Option<bool>,
}

impl AuthOutcome {
    fn nothing() -> Self {
        Self {
            response: None,
            result: None,
        }
    }
}

/// CHAP responder with the MD5 algorithm.
pub struct Chap {
    username: String,
    secret: String,
}

impl Chap {
    /// Only method 5 (MD5) is supported.
    pub fn new(method: u8, username: &str, secret: &str) -> Option<Self> {
        if method != super::MD5 {
            return None;
        }

        Some(Self {
            username: username.to_string(),
            secret: secret.to_string(),
        })
    }

    fn process_challenge(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let identifier = packet[1];
        let data = &packet[CHAP_HEADER_SZ..];

        let value_size = *data.first()? as usize;
        let value = data.get(1..1 + value_size)?;

        // digest = MD5(identifier | secret | challenge value)
        let mut hasher = Md5::new();
        hasher.update([identifier]);
        hasher.update(self.secret.as_bytes());
        hasher.update(value);
        let digest = hasher.finalize();

        let length = CHAP_HEADER_SZ + 1 + digest.len() + self.username.len();

        let mut response = Vec::with_capacity(length);
        response.push(CHAP_RESPONSE);
        response.push(identifier);
        response.extend_from_slice(&(length as u16).to_be_bytes());
        response.push(digest.len() as u8);
        response.extend_from_slice(&digest);
        response.extend_from_slice(self.username.as_bytes());

        Some(response)
    }

    pub fn process_packet(&mut self, packet: &[u8]) -> AuthOutcome {
        if packet.len() < CHAP_HEADER_SZ {
            return AuthOutcome::nothing();
        }

        match packet[0] {
            CHAP_CHALLENGE => AuthOutcome {
                response: self.process_challenge(packet),
                result: None,
            },
            CHAP_SUCCESS => AuthOutcome {
                response: None,
                result: Some(true),
            },
            CHAP_FAILURE => AuthOutcome {
                response: None,
                result: Some(false),
            },
            _ => AuthOutcome::nothing(),
        }
    }
}

/// What the PAP retry timer decided.
pub enum PapTimeout {
    /// Retransmit this packet.
    Resend(Vec<u8>),
    /// Retries exhausted; authentication failed.
    Failed,
    /// Nothing due.
    Idle,
}

/// PAP authenticator: sends Authenticate-Request and retries on a fixed
/// timer until acked, naked, or out of attempts.
pub struct Pap {
    authreq: Vec<u8>,
    retries: u32,
    deadline: Option<Instant>,
}

impl Pap {
    pub fn new(username: &str, password: &str) -> Self {
        let length = CHAP_HEADER_SZ + 1 + username.len() + 1 + password.len();

        let mut authreq = Vec::with_capacity(length);
        authreq.push(PAP_REQUEST);
        authreq.push(1);
        authreq.extend_from_slice(&(length as u16).to_be_bytes());
        authreq.push(username.len() as u8);
        authreq.extend_from_slice(username.as_bytes());
        authreq.push(password.len() as u8);
        authreq.extend_from_slice(password.as_bytes());

        Self {
            authreq,
            retries: 0,
            deadline: None,
        }
    }

    /// Starts the exchange, returning the first Authenticate-Request.
    pub fn start(&mut self, now: Instant) -> Vec<u8> {
        self.retries = 0;
        self.deadline = Some(now + PAP_TIMEOUT);
        self.authreq.clone()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn handle_timeout(&mut self, now: Instant) -> PapTimeout {
        match self.deadline {
            Some(d) if now >= d => {}
            _ => return PapTimeout::Idle,
        }

        self.retries += 1;
        if self.retries >= PAP_MAX_RETRY {
            self.deadline = None;
            return PapTimeout::Failed;
        }

        // RFC 1334 2.2.1: the identifier changes on every new request.
        self.authreq[1] = self.authreq[1].wrapping_add(1);
        self.deadline = Some(now + PAP_TIMEOUT);

        PapTimeout::Resend(self.authreq.clone())
    }

    pub fn process_packet(&mut self, packet: &[u8]) -> AuthOutcome {
        if packet.len() < CHAP_HEADER_SZ {
            return AuthOutcome::nothing();
        }

        match packet[0] {
            PAP_ACK => {
                self.deadline = None;
                AuthOutcome {
                    response: None,
                    result: Some(true),
                }
            }
            PAP_NAK => {
                self.deadline = None;
                AuthOutcome {
                    response: None,
                    result: Some(false),
                }
            }
            _ => AuthOutcome::nothing(),
        }
    }
}
