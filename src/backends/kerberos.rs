//! Builtin Kerberos v5 sub-context, grounded in `sspi::Kerberos` the same way
//! the teacher's `NtlmGssAuthSession` grounds NTLM in `sspi::Ntlm` — the
//! concrete Kerberos wire exchange and the KDC conversation are the external
//! collaborator named in spec.md §1/§6; this module only adapts `sspi`'s
//! builder API to the [`SubContext`] contract.

use sspi::{
    AcquireCredentialsHandleResult, AuthIdentity, BufferType, ClientRequestFlags,
    CredentialUse, CredentialsBuffers, DataRepresentation, Kerberos, KerberosConfig,
    SecurityBuffer, SecurityBufferRef, SecurityStatus, ServerRequestFlags, Sspi, SspiImpl,
};
use url::Url;

use crate::context::{ContextReq, Qop, SubContext, Unwrapped, Usage, Wrapped};
use crate::error::Error;

#[derive(Debug)]
pub struct KerberosContext {
    usage: Usage,
    target_name: String,
    kerberos: Kerberos,
    acq_cred_result: AcquireCredentialsHandleResult<Option<CredentialsBuffers>>,
    last_status: Option<SecurityStatus>,
    out_seq_num: u32,
    in_seq_num: u32,
    mech_changed: bool,
}

impl KerberosContext {
    /// `kdc_url` is `None` when relying on DNS SRV discovery, matching how a
    /// real deployment would normally be configured; the teacher always
    /// supplies an explicit URL because it targets one fixed test domain.
    pub fn new(
        identity: AuthIdentity,
        target_name: String,
        kdc_url: Option<Url>,
        usage: Usage,
    ) -> Result<Self, Error> {
        let mut kerberos = Kerberos::new_client_from_config(KerberosConfig {
            kdc_url,
            client_computer_name: None,
        })
        .map_err(|e| Error::AuthenticationFailed(e.to_string()))?;

        let credential_use = match usage {
            Usage::Initiate => CredentialUse::Outbound,
            Usage::Accept => CredentialUse::Inbound,
        };
        let acq_cred_result = kerberos
            .acquire_credentials_handle()
            .with_credential_use(credential_use)
            .with_auth_data(&sspi::Credentials::AuthIdentity(identity))
            .execute(&mut kerberos)
            .map_err(|e| Error::AuthenticationFailed(e.to_string()))?;

        Ok(Self {
            usage,
            target_name,
            kerberos,
            acq_cred_result,
            last_status: None,
            out_seq_num: 0,
            in_seq_num: 0,
            mech_changed: false,
        })
    }

    fn step_initiate(&mut self, in_token: Option<&[u8]>) -> Result<Option<Vec<u8>>, Error> {
        let mut output_buffer = vec![SecurityBuffer::new(Vec::new(), BufferType::Token)];

        let mut builder = self
            .kerberos
            .initialize_security_context()
            .with_credentials_handle(&mut self.acq_cred_result.credentials_handle)
            .with_context_requirements(
                ClientRequestFlags::MUTUAL_AUTH | ClientRequestFlags::INTEGRITY,
            )
            .with_target_data_representation(DataRepresentation::Native)
            .with_target_name(&self.target_name)
            .with_output(&mut output_buffer);

        let mut input_buffers = Vec::new();
        if let Some(token) = in_token {
            input_buffers.push(SecurityBuffer::new(token.to_vec(), BufferType::Token));
            builder = builder.with_input(&mut input_buffers);
        }

        let result = self
            .kerberos
            .initialize_security_context_impl(&mut builder)
            .map_err(|e| Error::AuthenticationFailed(e.to_string()))?
            .resolve_with_default_network_client()
            .map_err(|e| Error::AuthenticationFailed(e.to_string()))?;

        self.last_status = Some(result.status);
        let out = output_buffer.pop().map(|b| b.buffer).unwrap_or_default();
        Ok(if out.is_empty() { None } else { Some(out) })
    }

    fn step_accept(&mut self, in_token: Option<&[u8]>) -> Result<Option<Vec<u8>>, Error> {
        let in_token = in_token.ok_or_else(|| {
            Error::InvalidState("Kerberos acceptor requires an input token".into())
        })?;

        let mut output_buffer = vec![SecurityBuffer::new(Vec::new(), BufferType::Token)];
        let mut input_buffers = vec![SecurityBuffer::new(in_token.to_vec(), BufferType::Token)];

        let builder = self
            .kerberos
            .accept_security_context()
            .with_credentials_handle(&mut self.acq_cred_result.credentials_handle)
            .with_context_requirements(ServerRequestFlags::empty())
            .with_target_data_representation(DataRepresentation::Native)
            .with_output(&mut output_buffer)
            .with_input(&mut input_buffers);

        let result = self
            .kerberos
            .accept_security_context_impl(builder)
            .map_err(|e| Error::AuthenticationFailed(e.to_string()))?
            .resolve_with_default_network_client()
            .map_err(|e| Error::AuthenticationFailed(e.to_string()))?;

        self.last_status = Some(result.status);
        let out = output_buffer.pop().map(|b| b.buffer).unwrap_or_default();
        Ok(if out.is_empty() { None } else { Some(out) })
    }
}

impl SubContext for KerberosContext {
    fn available_protocols(&self, _req: ContextReq) -> Vec<&'static str> {
        vec!["kerberos"]
    }

    fn step(&mut self, in_token: Option<&[u8]>) -> Result<Option<Vec<u8>>, Error> {
        match self.usage {
            Usage::Initiate => self.step_initiate(in_token),
            Usage::Accept => self.step_accept(in_token),
        }
    }

    fn complete(&self) -> bool {
        matches!(self.last_status, Some(SecurityStatus::Ok))
    }

    fn session_key(&self) -> Result<Vec<u8>, Error> {
        if !self.complete() {
            return Err(Error::NotComplete);
        }
        Ok(self.kerberos.query_context_session_key()?.session_key)
    }

    fn negotiated_protocol(&self) -> Result<&'static str, Error> {
        if !self.complete() {
            return Err(Error::NotComplete);
        }
        Ok("kerberos")
    }

    fn wrap(&mut self, data: &[u8], encrypt: bool, _qop: Qop) -> Result<Wrapped, Error> {
        if !self.complete() {
            return Err(Error::NotComplete);
        }
        if !encrypt {
            let mic = self.sign(data, 0)?;
            let mut ciphertext = data.to_vec();
            ciphertext.extend_from_slice(&mic);
            return Ok(Wrapped {
                ciphertext,
                encrypted: false,
            });
        }

        let mut message = vec![
            SecurityBuffer::new(data.to_vec(), BufferType::Data),
            SecurityBuffer::new(vec![0u8; 16], BufferType::Token),
        ];
        self.kerberos
            .encrypt_message(0, &mut message, self.out_seq_num)?;
        self.out_seq_num += 1;
        let mut ciphertext = message[0].buffer.clone();
        ciphertext.extend_from_slice(&message[1].buffer);
        Ok(Wrapped {
            ciphertext,
            encrypted: true,
        })
    }

    fn unwrap(&mut self, data: &[u8]) -> Result<Unwrapped, Error> {
        if !self.complete() {
            return Err(Error::NotComplete);
        }
        if data.len() < 16 {
            return Err(Error::IntegrityFailure("wrapped message too short".into()));
        }
        let (body, trailer) = data.split_at(data.len() - 16);
        if self.verify(body, trailer).is_ok() {
            return Ok(Unwrapped {
                plaintext: body.to_vec(),
                encrypted: false,
                qop: 0,
            });
        }

        let mut message = vec![
            SecurityBuffer::new(body.to_vec(), BufferType::Data),
            SecurityBuffer::new(trailer.to_vec(), BufferType::Token),
        ];
        self.kerberos.decrypt_message(&mut message, self.in_seq_num)?;
        self.in_seq_num += 1;
        Ok(Unwrapped {
            plaintext: message[0].buffer.clone(),
            encrypted: true,
            qop: 0,
        })
    }

    fn sign(&mut self, data: &[u8], _qop: Qop) -> Result<Vec<u8>, Error> {
        if !self.complete() {
            return Err(Error::NotComplete);
        }
        let mut data_buffer = data.to_vec();
        let mut signature = vec![0u8; 16];
        let mut buffers = vec![
            SecurityBufferRef::data_buf(&mut data_buffer),
            SecurityBufferRef::token_buf(&mut signature),
        ];
        self.kerberos
            .make_signature(0, &mut buffers, self.out_seq_num)?;
        Ok(signature)
    }

    fn verify(&mut self, data: &[u8], mic: &[u8]) -> Result<Qop, Error> {
        if !self.complete() {
            return Err(Error::NotComplete);
        }
        let mut data_buffer = data.to_vec();
        let mut mic_buffer = mic.to_vec();
        let mut buffers = vec![
            SecurityBufferRef::data_buf(&mut data_buffer),
            SecurityBufferRef::token_buf(&mut mic_buffer),
        ];
        self.kerberos
            .verify_signature(&mut buffers, self.in_seq_num)
            .map_err(|e| Error::IntegrityFailure(e.to_string()))?;
        Ok(0)
    }

    fn requires_mech_list_mic(&self) -> bool {
        // Per spec.md §4.1: Kerberos backends only demand the SPNEGO MIC
        // when the initiator's optimistic first token was not the one the
        // peer ended up choosing.
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
