//! The remote execution plane. Every cross-host effect in the runner
//! goes through a `SshPool`.
//!
//! The pool keeps one session per (host, user), opened lazily on first
//! use. Action commands run through a spurs shell and treat a non-zero
//! exit as an error; probe commands run through a raw libssh2 channel and
//! hand back stdout, stderr, and the exit status as data. A transport
//! failure discards the session so the next call reconnects; retrying is
//! a policy decision of the caller, not this layer.
//!
//! Host keys are accepted as seen. The hosts are ephemeral cloud
//! instances; a stricter policy belongs to the deployer.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use spurs::{Execute, SshCommand, SshOutput, SshShell};

use crate::error::RunnerError;

/// Result of a probe-style remote command. A non-zero exit status is data
/// here, not an error; only transport failures surface as `Err`.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl ExecOutput {
    pub fn ok(&self) -> bool {
        self.status == 0
    }
}

struct HostConn {
    shell: SshShell,
    sess: ssh2::Session,
}

pub struct SshPool {
    user: String,
    conns: HashMap<String, HostConn>,
}

impl SshPool {
    pub fn new(user: &str) -> Self {
        SshPool {
            user: user.to_owned(),
            conns: HashMap::new(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Hosts are usually given as bare addresses; SSH wants a port.
    fn with_port(host: &str) -> String {
        if host.contains(':') {
            host.to_owned()
        } else {
            format!("{}:22", host)
        }
    }

    fn default_key() -> Result<PathBuf, failure::Error> {
        let home = std::env::var("HOME")?;
        for name in &["id_rsa", "id_ed25519"] {
            let key = Path::new(&home).join(".ssh").join(name);
            if key.exists() {
                return Ok(key);
            }
        }
        Err(failure::format_err!(
            "no usable private key under {}/.ssh",
            home
        ))
    }

    fn transport_err(host: &str, err: impl std::fmt::Display) -> failure::Error {
        RunnerError::Transport {
            host: host.to_owned(),
            reason: err.to_string(),
        }
        .into()
    }

    fn connect(user: &str, host: &str) -> Result<HostConn, failure::Error> {
        let addr = Self::with_port(host);

        debug!("opening ssh session to {}@{}", user, addr);
        let shell = SshShell::with_default_key(user, &addr)?;

        // A second, raw session carries probe commands and SFTP traffic.
        let tcp = TcpStream::connect(&addr).map_err(|e| Self::transport_err(host, e))?;
        let mut sess = ssh2::Session::new().map_err(|e| Self::transport_err(host, e))?;
        sess.set_tcp_stream(tcp);
        sess.handshake().map_err(|e| Self::transport_err(host, e))?;
        let key = Self::default_key()?;
        sess.userauth_pubkey_file(user, None, &key, None)
            .map_err(|e| Self::transport_err(host, e))?;

        Ok(HostConn { shell, sess })
    }

    fn conn(&mut self, host: &str) -> Result<&mut HostConn, failure::Error> {
        let user = self.user.clone();
        match self.conns.entry(host.to_owned()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => Ok(v.insert(Self::connect(&user, host)?)),
        }
    }

    /// Run an action command through the pooled shell. A non-zero exit is
    /// an error unless the command was built with `allow_error()`.
    pub fn run(&mut self, host: &str, cmd: SshCommand) -> Result<SshOutput, failure::Error> {
        match self.conn(host)?.shell.run(cmd) {
            Ok(out) => Ok(out),
            Err(err) => {
                // The session may be mid-command or torn; reopen next call.
                self.conns.remove(host);
                Err(failure::Error::from(err))
            }
        }
    }

    /// Run a probe command and return `(stdout, stderr, status)` even on
    /// non-zero exit. `timeout_secs`, when given, wraps the command in
    /// coreutils `timeout` (status 124 on expiry); it is only meaningful
    /// for a simple command, not a pipeline.
    pub fn exec(
        &mut self,
        host: &str,
        command: &str,
        timeout_secs: Option<u64>,
    ) -> Result<ExecOutput, failure::Error> {
        let command = match timeout_secs {
            Some(secs) => format!("timeout {} {}", secs, command),
            None => command.to_owned(),
        };

        debug!("exec on {}: {}", host, command);

        let res = channel_exec(&self.conn(host)?.sess, &command);
        match res {
            Ok(out) => Ok(out),
            Err(err) => {
                self.conns.remove(host);
                Err(Self::transport_err(host, err))
            }
        }
    }

    /// Hand a command to the remote shell and return as soon as it has
    /// been accepted. The remote side redirects all stdio to `/dev/null`,
    /// so the spawned process holds no descriptor back to the control
    /// node and can later be checkpointed.
    pub fn exec_background(&mut self, host: &str, command: &str) -> Result<(), failure::Error> {
        let wrapped = format!("{} > /dev/null 2>&1 < /dev/null &", command);

        debug!("background exec on {}: {}", host, wrapped);

        let sess = &self.conn(host)?.sess;
        let res = (|| -> Result<(), failure::Error> {
            let mut channel = sess.channel_session()?;
            channel.exec(&wrapped)?;
            channel.send_eof()?;
            Ok(())
        })();

        res.map_err(|err| {
            self.conns.remove(host);
            Self::transport_err(host, err)
        })
    }

    /// Write `content` to `remote` on `host` over SFTP.
    pub fn upload_bytes(
        &mut self,
        host: &str,
        content: &[u8],
        remote: &str,
    ) -> Result<(), failure::Error> {
        let res = (|| -> Result<(), failure::Error> {
            let sftp = self.conn(host)?.sess.sftp()?;
            let mut f = sftp.create(Path::new(remote))?;
            f.write_all(content)?;
            Ok(())
        })();

        res.map_err(|err| {
            self.conns.remove(host);
            Self::transport_err(host, err)
        })
    }

    /// Copy a local file to `remote` on `host` over SFTP.
    pub fn upload_file(
        &mut self,
        host: &str,
        local: &Path,
        remote: &str,
    ) -> Result<(), failure::Error> {
        let mut content = Vec::new();
        File::open(local)?.read_to_end(&mut content)?;
        self.upload_bytes(host, &content, remote)
    }

    /// Fetch a single remote file into `local`.
    pub fn download_file(
        &mut self,
        host: &str,
        remote: &str,
        local: &Path,
    ) -> Result<(), failure::Error> {
        let res = (|| -> Result<(), failure::Error> {
            let sftp = self.conn(host)?.sess.sftp()?;
            let mut f = sftp.open(Path::new(remote))?;
            let mut content = Vec::new();
            f.read_to_end(&mut content)?;
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent)?;
            }
            File::create(local)?.write_all(&content)?;
            Ok(())
        })();

        res.map_err(|err| {
            self.conns.remove(host);
            Self::transport_err(host, err)
        })
    }

    /// Fetch every file under `remote_dir` (one level of subdirectories
    /// included) whose name ends with `suffix`. Files from a subdirectory
    /// land as `{subdir}_{name}` so the flattened batch stays unambiguous.
    ///
    /// Individually recoverable: a file that fails to copy is skipped with
    /// a warning, and the list of files actually written is returned.
    pub fn download_dir(
        &mut self,
        host: &str,
        remote_dir: &str,
        local_dir: &Path,
        suffix: &str,
    ) -> Result<Vec<PathBuf>, failure::Error> {
        std::fs::create_dir_all(local_dir)?;

        let sftp = match self.conn(host)?.sess.sftp() {
            Ok(sftp) => sftp,
            Err(err) => {
                self.conns.remove(host);
                return Err(Self::transport_err(host, err));
            }
        };

        let mut fetched = Vec::new();
        let entries = sftp
            .readdir(Path::new(remote_dir))
            .map_err(|e| Self::transport_err(host, e))?;

        for (path, stat) in entries {
            if stat.is_dir() {
                let subdir = match path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_owned(),
                    None => continue,
                };
                let sub_entries = match sftp.readdir(&path) {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!("skipping {}: {}", path.display(), err);
                        continue;
                    }
                };
                for (sub_path, sub_stat) in sub_entries {
                    if sub_stat.is_file() {
                        fetch_one(&sftp, &sub_path, local_dir, Some(&subdir), suffix, &mut fetched);
                    }
                }
            } else if stat.is_file() {
                fetch_one(&sftp, &path, local_dir, None, suffix, &mut fetched);
            }
        }

        Ok(fetched)
    }

    /// Drop the session for `host`, if any.
    pub fn close(&mut self, host: &str) {
        self.conns.remove(host);
    }

    /// Drop every pooled session.
    pub fn close_all(&mut self) {
        self.conns.clear();
    }
}

fn channel_exec(sess: &ssh2::Session, command: &str) -> Result<ExecOutput, failure::Error> {
    let mut channel = sess.channel_session()?;
    channel.exec(command)?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr)?;

    channel.wait_close()?;
    let status = channel.exit_status()?;

    Ok(ExecOutput {
        stdout,
        stderr,
        status,
    })
}

#[cfg(test)]
mod test {
    use super::SshPool;

    #[test]
    fn bare_addresses_get_the_ssh_port() {
        assert_eq!(SshPool::with_port("10.0.0.1"), "10.0.0.1:22");
        assert_eq!(SshPool::with_port("10.0.0.1:2222"), "10.0.0.1:2222");
    }

    #[test]
    fn closing_unopened_sessions_is_a_noop() {
        let mut pool = SshPool::new("ubuntu");
        pool.close("10.0.0.1");
        pool.close_all();
        assert_eq!(pool.user(), "ubuntu");
    }
}

fn fetch_one(
    sftp: &ssh2::Sftp,
    remote: &Path,
    local_dir: &Path,
    prefix: Option<&str>,
    suffix: &str,
    fetched: &mut Vec<PathBuf>,
) {
    let name = match remote.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.to_owned(),
        None => return,
    };
    if !name.ends_with(suffix) {
        return;
    }

    let local_name = match prefix {
        Some(prefix) => format!("{}_{}", prefix, name),
        None => name,
    };
    let local = local_dir.join(local_name);

    let res = (|| -> Result<(), failure::Error> {
        let mut f = sftp.open(remote)?;
        let mut content = Vec::new();
        f.read_to_end(&mut content)?;
        File::create(&local)?.write_all(&content)?;
        Ok(())
    })();

    match res {
        Ok(()) => fetched.push(local),
        Err(err) => warn!("skipping {}: {}", remote.display(), err),
    }
}
