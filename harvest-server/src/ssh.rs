//! SSH session executor for managed hosts.

use crate::config::SshConfig;
use harvest_core::{ExecStatus, HarvestError, RemoteExecutor};
use ssh2::Session;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

pub struct SshExecutor {
    host: String,
    session: Session,
}

impl SshExecutor {
    /// Connect and authenticate; only this step is time-boxed.
    pub fn connect(host: &str, opts: &SshConfig, timeout: Duration) -> harvest_core::Result<Self> {
        let fail = |e: &dyn std::fmt::Display| HarvestError::connectivity(host, e);

        let addr = (host, opts.port)
            .to_socket_addrs()
            .map_err(|e| fail(&e))?
            .next()
            .ok_or_else(|| fail(&"no address"))?;
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| fail(&e))?;

        let mut sess = Session::new().map_err(|e| fail(&e))?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        sess.handshake().map_err(|e| fail(&e))?;

        let auth = match &opts.identity_file {
            Some(key) => sess.userauth_pubkey_file(&opts.user, None, key, None),
            None => sess.userauth_agent(&opts.user),
        };
        auth.map_err(|e| fail(&format!("SSH authentication failed: {e}")))?;

        if !sess.authenticated() {
            return Err(fail(&"SSH authentication failed"));
        }
        // commands run to completion once started
        sess.set_timeout(0);

        tracing::debug!(host, user = %opts.user, "SSH session established");
        Ok(Self {
            host: host.to_string(),
            session: sess,
        })
    }
}

impl RemoteExecutor for SshExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    fn is_local(&self) -> bool {
        false
    }

    fn run_streaming(&mut self, command: &str, sink: &mut dyn Write) -> harvest_core::Result<ExecStatus> {
        let host = self.host.as_str();
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| HarvestError::connectivity(host, e))?;
        channel
            .exec(command)
            .map_err(|e| HarvestError::connectivity(host, e))?;

        std::io::copy(&mut channel, sink).map_err(|e| HarvestError::transfer(host, e))?;

        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| HarvestError::transfer(host, e))?;
        channel
            .wait_close()
            .map_err(|e| HarvestError::connectivity(host, e))?;
        let exit_code = channel
            .exit_status()
            .map_err(|e| HarvestError::connectivity(host, e))?;

        Ok(ExecStatus { exit_code, stderr })
    }
}

impl Drop for SshExecutor {
    fn drop(&mut self) {
        let _ = self.session.disconnect(None, "log collection finished", None);
    }
}
