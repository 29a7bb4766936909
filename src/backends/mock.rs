//! Deterministic, in-memory stand-in for a real mechanism backend, used only
//! by this crate's own test suite to drive [`crate::spnego::SpnegoContext`]
//! through full two-party handshakes without a live KDC or a real NTLM
//! implementation. See SPEC_FULL.md §8 for why the real `sspi`-backed
//! backends aren't exercised end-to-end in-tree.
#![cfg(test)]

use crate::context::{ContextReq, Qop, SubContext, Unwrapped, Usage, Wrapped};
use crate::error::Error;

const NEGOTIATE: &[u8] = b"MOCK-NEGOTIATE";
const CHALLENGE: &[u8] = b"MOCK-CHALLENGE";
const AUTHENTICATE: &[u8] = b"MOCK-AUTHENTICATE";

#[derive(Debug)]
pub struct MockContext {
    usage: Usage,
    shared_secret: Vec<u8>,
    round: u8,
    complete: bool,
    mech_changed: bool,
    out_seq_num: u32,
    in_seq_num: u32,
}

impl MockContext {
    pub fn new(shared_secret: impl Into<Vec<u8>>, usage: Usage) -> Self {
        Self {
            usage,
            shared_secret: shared_secret.into(),
            round: 0,
            complete: false,
            mech_changed: false,
            out_seq_num: 0,
            in_seq_num: 0,
        }
    }

    /// A deterministic, keyed checksum — not cryptographically sound, but
    /// enough to exercise MIC success/failure branching in tests: same key
    /// and data always produce the same bytes, and any bit flip anywhere
    /// changes the result.
    fn checksum(&self, seq: u32, data: &[u8]) -> Vec<u8> {
        let mut state: u64 = 0xcbf29ce484222325 ^ seq as u64;
        for &b in self.shared_secret.iter().chain(data.iter()) {
            state ^= b as u64;
            state = state.wrapping_mul(0x100000001b3);
        }
        state.to_le_bytes().to_vec()
    }
}

impl SubContext for MockContext {
    fn available_protocols(&self, _req: ContextReq) -> Vec<&'static str> {
        vec!["mock"]
    }

    fn step(&mut self, in_token: Option<&[u8]>) -> Result<Option<Vec<u8>>, Error> {
        match (self.usage, self.round, in_token) {
            (Usage::Initiate, 0, None) => {
                self.round = 1;
                Ok(Some(NEGOTIATE.to_vec()))
            }
            (Usage::Initiate, 1, Some(tok)) if tok == CHALLENGE => {
                self.round = 2;
                self.complete = true;
                Ok(Some(AUTHENTICATE.to_vec()))
            }
            (Usage::Accept, 0, Some(tok)) if tok == NEGOTIATE => {
                self.round = 1;
                Ok(Some(CHALLENGE.to_vec()))
            }
            // No NEGOTIATE was ever received — this mechanism was picked as a
            // SPNEGO fallback after the initiator's optimistic token named a
            // different mechanism (spec.md §4.3 tie-breaks). Produce a
            // CHALLENGE from scratch, as the real NTLM backend also does.
            (Usage::Accept, 0, None) => {
                self.round = 1;
                Ok(Some(CHALLENGE.to_vec()))
            }
            (Usage::Accept, 1, Some(tok)) if tok == AUTHENTICATE => {
                self.round = 2;
                self.complete = true;
                Ok(None)
            }
            _ => Err(Error::InvalidState(format!(
                "mock backend received unexpected token at usage={:?} round={}",
                self.usage, self.round
            ))),
        }
    }

    fn complete(&self) -> bool {
        self.complete
    }

    fn session_key(&self) -> Result<Vec<u8>, Error> {
        if !self.complete {
            return Err(Error::NotComplete);
        }
        Ok(self.checksum(u32::MAX, b"session-key"))
    }

    fn negotiated_protocol(&self) -> Result<&'static str, Error> {
        if !self.complete {
            return Err(Error::NotComplete);
        }
        Ok("mock")
    }

    fn wrap(&mut self, data: &[u8], encrypt: bool, _qop: Qop) -> Result<Wrapped, Error> {
        if !self.complete {
            return Err(Error::NotComplete);
        }
        let mic = self.sign(data, 0)?;
        let mut ciphertext = if encrypt {
            data.iter()
                .zip(self.shared_secret.iter().cycle())
                .map(|(d, k)| d ^ k)
                .collect::<Vec<u8>>()
        } else {
            data.to_vec()
        };
        ciphertext.extend_from_slice(&mic);
        Ok(Wrapped {
            ciphertext,
            encrypted: encrypt,
        })
    }

    fn unwrap(&mut self, data: &[u8]) -> Result<Unwrapped, Error> {
        if !self.complete {
            return Err(Error::NotComplete);
        }
        if data.len() < 8 {
            return Err(Error::IntegrityFailure("wrapped message too short".into()));
        }
        let (body, mic) = data.split_at(data.len() - 8);
        // Try unencrypted first, then XOR-decrypted; whichever's MIC verifies wins.
        if self.verify(body, mic).is_ok() {
            return Ok(Unwrapped {
                plaintext: body.to_vec(),
                encrypted: false,
                qop: 0,
            });
        }
        let plaintext = body
            .iter()
            .zip(self.shared_secret.iter().cycle())
            .map(|(d, k)| d ^ k)
            .collect::<Vec<u8>>();
        self.verify(&plaintext, mic)?;
        Ok(Unwrapped {
            plaintext,
            encrypted: true,
            qop: 0,
        })
    }

    fn sign(&mut self, data: &[u8], _qop: Qop) -> Result<Vec<u8>, Error> {
        if !self.complete {
            return Err(Error::NotComplete);
        }
        let mic = self.checksum(self.out_seq_num, data);
        self.out_seq_num += 1;
        Ok(mic)
    }

    fn verify(&mut self, data: &[u8], mic: &[u8]) -> Result<Qop, Error> {
        if !self.complete {
            return Err(Error::NotComplete);
        }
        let expected = self.checksum(self.in_seq_num, data);
        self.in_seq_num += 1;
        if expected == mic {
            Ok(0)
        } else {
            Err(Error::IntegrityFailure("MIC mismatch".into()))
        }
    }

    fn requires_mech_list_mic(&self) -> bool {
        self.mech_changed
    }

    fn mark_mech_changed(&mut self) {
        self.mech_changed = true;
    }

    fn reset_crypto_counters(&mut self, outgoing: bool) {
        if outgoing {
            self.out_seq_num = 0;
        } else {
            self.in_seq_num = 0;
        }
    }
}
