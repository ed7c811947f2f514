//! Workloads the orchestrator can migrate.
//!
//! The orchestrator never embeds workload logic. Each workload ships a
//! standalone script that is deployed to both hosts and obeys the
//! filesystem handshake:
//!
//!  - write `workload.pid` at startup (PID discovery),
//!  - create `checkpoint_ready` once stable and safe to checkpoint,
//!  - exit cleanly when `checkpoint_flag` disappears.
//!
//! Beyond the handshake, the orchestrator only knows each workload's type
//! tag, which drives the two type-conditional behaviors: the
//! `--tcp-established` CRIU flag and the post-restore health check.

use log::{info, warn};
use serde::Serialize;
use spurs::cmd;

use crate::error::RunnerError;
use crate::remote::SshPool;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Memory,
    Matmul,
    Redis,
    Video,
}

impl WorkloadKind {
    pub fn from_cli(s: &str) -> Result<Self, String> {
        match s {
            "memory" => Ok(WorkloadKind::Memory),
            "matmul" => Ok(WorkloadKind::Matmul),
            "redis" => Ok(WorkloadKind::Redis),
            "video" => Ok(WorkloadKind::Video),
            other => Err(format!("unknown workload: {}", other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Memory => "memory",
            WorkloadKind::Matmul => "matmul",
            WorkloadKind::Redis => "redis",
            WorkloadKind::Video => "video",
        }
    }

    /// Workloads holding live TCP connections need `--tcp-established`
    /// on every CRIU dump and restore.
    pub fn needs_tcp_established(self) -> bool {
        self == WorkloadKind::Redis
    }

    /// Pattern used to find (and, on cleanup, kill) the workload's
    /// processes.
    pub fn process_pattern(self) -> String {
        format!("{}_standalone.py", self.as_str())
    }
}

/// Every tunable a workload can take from the CLI, with defaults matching
/// the standalone scripts.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadSettings {
    pub mb_size: usize,
    pub max_memory_mb: usize,
    pub interval_secs: f64,

    pub matrix_size: usize,
    /// 0 means run until told to stop.
    pub iterations: usize,

    pub redis_port: u16,
    pub num_keys: usize,
    pub value_size: usize,

    pub resolution: String,
    pub fps: u32,
    pub duration_secs: u64,
    pub video_mode: String,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        WorkloadSettings {
            mb_size: 256,
            max_memory_mb: 4096,
            interval_secs: 1.0,
            matrix_size: 2048,
            iterations: 0,
            redis_port: 6379,
            num_keys: 100_000,
            value_size: 1024,
            resolution: "1920x1080".into(),
            fps: 30,
            duration_secs: 300,
            video_mode: "live".into(),
        }
    }
}

/// The contract every workload exposes to the orchestrator.
pub trait Workload {
    fn kind(&self) -> WorkloadKind;

    fn script_name(&self) -> &'static str;

    fn script_content(&self) -> &'static str;

    /// Full shell invocation, run from inside the working directory.
    fn command(&self, working_dir: &str) -> String;

    /// System packages the script needs; installed best-effort.
    fn dependencies(&self) -> Vec<&'static str> {
        vec![]
    }

    /// Local pre-flight.
    fn validate_config(&self) -> Result<(), failure::Error> {
        Ok(())
    }
}

pub fn create(kind: WorkloadKind, settings: &WorkloadSettings) -> Box<dyn Workload> {
    match kind {
        WorkloadKind::Memory => Box::new(MemoryWorkload {
            mb_size: settings.mb_size,
            max_memory_mb: settings.max_memory_mb,
            interval_secs: settings.interval_secs,
        }),
        WorkloadKind::Matmul => Box::new(MatmulWorkload {
            matrix_size: settings.matrix_size,
            iterations: settings.iterations,
        }),
        WorkloadKind::Redis => Box::new(RedisWorkload {
            port: settings.redis_port,
            num_keys: settings.num_keys,
            value_size: settings.value_size,
        }),
        WorkloadKind::Video => Box::new(VideoWorkload {
            resolution: settings.resolution.clone(),
            fps: settings.fps,
            duration_secs: settings.duration_secs,
            mode: settings.video_mode.clone(),
        }),
    }
}

/// Deploy a workload to `host`: push the standalone script into the
/// working directory and install its dependencies.
pub fn deploy(
    workload: &dyn Workload,
    pool: &mut SshPool,
    host: &str,
    working_dir: &str,
) -> Result<(), failure::Error> {
    let fail = |detail: String| -> failure::Error {
        RunnerError::Deploy {
            host: host.to_owned(),
            detail,
        }
        .into()
    };

    pool.run(host, cmd!("mkdir -p {}", working_dir))
        .map_err(|e| fail(e.to_string()))?;

    let script_path = dir!(working_dir, workload.script_name());
    pool.upload_bytes(host, workload.script_content().as_bytes(), &script_path)
        .map_err(|e| fail(e.to_string()))?;
    pool.run(host, cmd!("chmod +x {}", script_path))
        .map_err(|e| fail(e.to_string()))?;

    info!("deployed {} to {}:{}", workload.script_name(), host, script_path);

    let deps = workload.dependencies();
    if !deps.is_empty() {
        let pkgs = deps.join(" ");
        let install = format!(
            "sudo apt-get install -y {} 2>/dev/null || sudo yum -y install {}",
            pkgs, pkgs
        );
        match pool.exec(host, &install, Some(300)) {
            Ok(out) if !out.ok() => {
                warn!("some dependencies may be missing on {}: {}", host, out.stderr.trim());
            }
            Ok(_) => {}
            Err(err) => return Err(fail(format!("installing {}: {}", pkgs, err))),
        }
    }

    Ok(())
}

// A memory grower: allocates and keeps touching pages so pre-dump
// iterations always find fresh dirty memory.
pub struct MemoryWorkload {
    pub mb_size: usize,
    pub max_memory_mb: usize,
    pub interval_secs: f64,
}

impl Workload for MemoryWorkload {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::Memory
    }

    fn script_name(&self) -> &'static str {
        "memory_standalone.py"
    }

    fn script_content(&self) -> &'static str {
        MEMORY_SCRIPT
    }

    fn command(&self, working_dir: &str) -> String {
        format!(
            "python3 memory_standalone.py --mb_size {} --max_memory_mb {} --interval {} --working_dir {}",
            self.mb_size, self.max_memory_mb, self.interval_secs, working_dir
        )
    }

    fn validate_config(&self) -> Result<(), failure::Error> {
        if self.mb_size == 0 || self.max_memory_mb < self.mb_size {
            failure::bail!(
                "memory workload needs 0 < mb_size <= max_memory_mb (got {} / {})",
                self.mb_size,
                self.max_memory_mb
            );
        }
        Ok(())
    }
}

pub struct MatmulWorkload {
    pub matrix_size: usize,
    pub iterations: usize,
}

impl Workload for MatmulWorkload {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::Matmul
    }

    fn script_name(&self) -> &'static str {
        "matmul_standalone.py"
    }

    fn script_content(&self) -> &'static str {
        MATMUL_SCRIPT
    }

    fn command(&self, working_dir: &str) -> String {
        format!(
            "python3 matmul_standalone.py --matrix_size {} --iterations {} --working_dir {}",
            self.matrix_size, self.iterations, working_dir
        )
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["python3-numpy"]
    }

    fn validate_config(&self) -> Result<(), failure::Error> {
        if self.matrix_size == 0 {
            failure::bail!("matmul workload needs a non-zero matrix size");
        }
        Ok(())
    }
}

pub struct RedisWorkload {
    pub port: u16,
    pub num_keys: usize,
    pub value_size: usize,
}

impl Workload for RedisWorkload {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::Redis
    }

    fn script_name(&self) -> &'static str {
        "redis_standalone.py"
    }

    fn script_content(&self) -> &'static str {
        REDIS_SCRIPT
    }

    fn command(&self, working_dir: &str) -> String {
        format!(
            "python3 redis_standalone.py --port {} --num_keys {} --value_size {} --working_dir {}",
            self.port, self.num_keys, self.value_size, working_dir
        )
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["redis-server", "redis-tools"]
    }

    fn validate_config(&self) -> Result<(), failure::Error> {
        if self.port == 0 {
            failure::bail!("redis workload needs a non-zero port");
        }
        Ok(())
    }
}

pub struct VideoWorkload {
    pub resolution: String,
    pub fps: u32,
    pub duration_secs: u64,
    pub mode: String,
}

impl Workload for VideoWorkload {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::Video
    }

    fn script_name(&self) -> &'static str {
        "video_standalone.py"
    }

    fn script_content(&self) -> &'static str {
        VIDEO_SCRIPT
    }

    fn command(&self, working_dir: &str) -> String {
        format!(
            "python3 video_standalone.py --resolution {} --fps {} --duration {} --mode {} --working_dir {}",
            self.resolution, self.fps, self.duration_secs, self.mode, working_dir
        )
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["ffmpeg"]
    }

    fn validate_config(&self) -> Result<(), failure::Error> {
        let mut parts = self.resolution.split('x');
        let ok = parts.next().map_or(false, |w| w.parse::<u32>().is_ok())
            && parts.next().map_or(false, |h| h.parse::<u32>().is_ok())
            && parts.next().is_none();
        if !ok {
            failure::bail!("video resolution must look like 1920x1080, got {}", self.resolution);
        }
        if self.mode != "live" && self.mode != "file" {
            failure::bail!("video mode must be 'live' or 'file', got {}", self.mode);
        }
        Ok(())
    }
}

const MEMORY_SCRIPT: &str = r#"#!/usr/bin/env python3
"""Memory grower workload: allocates blocks up to a cap, then keeps
rewriting them so every page stays dirty."""
import argparse
import os
import time


def main():
    p = argparse.ArgumentParser()
    p.add_argument('--mb_size', type=int, default=256)
    p.add_argument('--max_memory_mb', type=int, default=4096)
    p.add_argument('--interval', type=float, default=1.0)
    p.add_argument('--working_dir', default='.')
    args = p.parse_args()

    wd = args.working_dir
    with open(os.path.join(wd, 'workload.pid'), 'w') as f:
        f.write(str(os.getpid()))

    flag = os.path.join(wd, 'checkpoint_flag')
    blocks = [bytearray(args.mb_size * 1024 * 1024)]

    with open(os.path.join(wd, 'checkpoint_ready'), 'w') as f:
        f.write('ready')

    stride = 4096
    while os.path.exists(flag):
        total_mb = len(blocks) * args.mb_size
        if total_mb < args.max_memory_mb:
            block = bytearray(args.mb_size * 1024 * 1024)
            for i in range(0, len(block), stride):
                block[i] = 1
            blocks.append(block)
        else:
            for block in blocks:
                for i in range(0, len(block), stride):
                    block[i] = (block[i] + 1) % 256
        time.sleep(args.interval)


if __name__ == '__main__':
    main()
"#;

const MATMUL_SCRIPT: &str = r#"#!/usr/bin/env python3
"""Matrix-multiply workload: repeated NxN multiplications."""
import argparse
import os
import time

import numpy as np


def main():
    p = argparse.ArgumentParser()
    p.add_argument('--matrix_size', type=int, default=2048)
    p.add_argument('--iterations', type=int, default=0, help='0 = until stopped')
    p.add_argument('--working_dir', default='.')
    args = p.parse_args()

    wd = args.working_dir
    with open(os.path.join(wd, 'workload.pid'), 'w') as f:
        f.write(str(os.getpid()))

    flag = os.path.join(wd, 'checkpoint_flag')
    n = args.matrix_size
    a = np.random.rand(n, n)
    b = np.random.rand(n, n)

    with open(os.path.join(wd, 'checkpoint_ready'), 'w') as f:
        f.write('ready')

    done = 0
    while os.path.exists(flag):
        a = np.matmul(a, b) % 1.0
        done += 1
        if args.iterations and done >= args.iterations:
            break
        time.sleep(0.1)


if __name__ == '__main__':
    main()
"#;

const REDIS_SCRIPT: &str = r#"#!/usr/bin/env python3
"""Redis workload: runs a redis-server child, fills it with keys, and
keeps rewriting a rolling window of them."""
import argparse
import os
import random
import string
import subprocess
import time


def cli(port, *args):
    return subprocess.run(
        ['redis-cli', '-p', str(port)] + list(args),
        capture_output=True, text=True
    ).stdout.strip()


def main():
    p = argparse.ArgumentParser()
    p.add_argument('--port', type=int, default=6379)
    p.add_argument('--num_keys', type=int, default=100000)
    p.add_argument('--value_size', type=int, default=1024)
    p.add_argument('--working_dir', default='.')
    args = p.parse_args()

    wd = args.working_dir
    with open(os.path.join(wd, 'workload.pid'), 'w') as f:
        f.write(str(os.getpid()))

    server = subprocess.Popen(
        ['redis-server', '--port', str(args.port), '--save', '', '--appendonly', 'no'],
        stdout=subprocess.DEVNULL, stderr=subprocess.DEVNULL
    )

    while cli(args.port, 'ping') != 'PONG':
        time.sleep(0.2)

    value = ''.join(random.choices(string.ascii_letters, k=args.value_size))
    for i in range(args.num_keys):
        cli(args.port, 'set', 'key:%d' % i, value)

    flag = os.path.join(wd, 'checkpoint_flag')
    with open(os.path.join(wd, 'checkpoint_ready'), 'w') as f:
        f.write('ready')

    i = 0
    while os.path.exists(flag):
        cli(args.port, 'set', 'key:%d' % (i % args.num_keys), value)
        i += 1
        time.sleep(0.01)

    cli(args.port, 'shutdown', 'nosave')
    server.wait(timeout=10)


if __name__ == '__main__':
    main()
"#;

const VIDEO_SCRIPT: &str = r#"#!/usr/bin/env python3
"""Video workload: drives an ffmpeg child encoding a synthetic test
pattern, either to a file or discarded (live)."""
import argparse
import os
import subprocess
import time


def main():
    p = argparse.ArgumentParser()
    p.add_argument('--resolution', default='1920x1080')
    p.add_argument('--fps', type=int, default=30)
    p.add_argument('--duration', type=int, default=300)
    p.add_argument('--mode', choices=['file', 'live'], default='live')
    p.add_argument('--working_dir', default='.')
    args = p.parse_args()

    wd = args.working_dir
    with open(os.path.join(wd, 'workload.pid'), 'w') as f:
        f.write(str(os.getpid()))

    source = 'testsrc=size=%s:rate=%d' % (args.resolution, args.fps)
    cmd = ['ffmpeg', '-y', '-f', 'lavfi', '-i', source, '-t', str(args.duration)]
    if args.mode == 'file':
        cmd += [os.path.join(wd, 'output.mp4')]
    else:
        cmd += ['-f', 'null', '-']

    encoder = subprocess.Popen(cmd, stdout=subprocess.DEVNULL, stderr=subprocess.DEVNULL)
    time.sleep(2)

    flag = os.path.join(wd, 'checkpoint_flag')
    with open(os.path.join(wd, 'checkpoint_ready'), 'w') as f:
        f.write('ready')

    while os.path.exists(flag) and encoder.poll() is None:
        time.sleep(0.5)

    if encoder.poll() is None:
        encoder.terminate()
        encoder.wait(timeout=10)


if __name__ == '__main__':
    main()
"#;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn commands_carry_settings() {
        let settings = WorkloadSettings::default();

        let memory = create(WorkloadKind::Memory, &settings);
        assert_eq!(
            memory.command("/tmp/criu_checkpoint"),
            "python3 memory_standalone.py --mb_size 256 --max_memory_mb 4096 \
             --interval 1 --working_dir /tmp/criu_checkpoint"
        );

        let redis = create(WorkloadKind::Redis, &settings);
        let cmd = redis.command("/wd");
        assert!(cmd.contains("--port 6379"));
        assert!(cmd.contains("--num_keys 100000"));
    }

    #[test]
    fn scripts_obey_the_handshake() {
        let settings = WorkloadSettings::default();
        for kind in &[
            WorkloadKind::Memory,
            WorkloadKind::Matmul,
            WorkloadKind::Redis,
            WorkloadKind::Video,
        ] {
            let w = create(*kind, &settings);
            let script = w.script_content();
            assert!(script.contains("workload.pid"), "{:?}", kind);
            assert!(script.contains("checkpoint_ready"), "{:?}", kind);
            assert!(script.contains("checkpoint_flag"), "{:?}", kind);
        }
    }

    #[test]
    fn tcp_flag_only_for_redis() {
        assert!(WorkloadKind::Redis.needs_tcp_established());
        assert!(!WorkloadKind::Memory.needs_tcp_established());
        assert!(!WorkloadKind::Video.needs_tcp_established());
    }

    #[test]
    fn validation_catches_bad_configs() {
        let bad = MemoryWorkload {
            mb_size: 512,
            max_memory_mb: 256,
            interval_secs: 1.0,
        };
        assert!(bad.validate_config().is_err());

        let bad = VideoWorkload {
            resolution: "widexhigh".into(),
            fps: 30,
            duration_secs: 10,
            mode: "live".into(),
        };
        assert!(bad.validate_config().is_err());

        let ok = RedisWorkload {
            port: 6380,
            num_keys: 10,
            value_size: 16,
        };
        assert!(ok.validate_config().is_ok());
    }
}
