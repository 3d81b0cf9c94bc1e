//! Shared fakes for integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256, Sha512};

use stagehand_core::exec::{CommandOutput, CommandRunner, HostEnv, HostOs};
use stagehand_core::metadata::{
    Destination, MetadataClient, MetadataError, PublicKey, TargetFileMeta, TargetFiles,
};
use stagehand_core::updater::CancelToken;

// =========================================================================
// Repository
// =========================================================================

/// Metadata for `data` with sha256 and sha512 digests.
pub fn meta_for_bytes(data: &[u8]) -> TargetFileMeta {
    let mut meta = TargetFileMeta {
        length: data.len() as u64,
        ..Default::default()
    };
    meta.hashes
        .insert("sha256".to_string(), Sha256::digest(data).to_vec().into());
    meta.hashes
        .insert("sha512".to_string(), Sha512::digest(data).to_vec().into());
    meta
}

/// What `MetadataClient::update` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateBehavior {
    #[default]
    Updated,
    Latest,
    Fail,
}

#[derive(Default)]
struct RepoState {
    files: BTreeMap<String, Vec<u8>>,
    downloads: Vec<String>,
    lookups: Vec<String>,
    init_calls: Vec<(usize, u32)>,
    update: UpdateBehavior,
    tamper: bool,
    cancel_mid_transfer: Option<CancelToken>,
}

/// In-memory signed repository shared between a test and its client.
#[derive(Clone, Default)]
pub struct FakeRepository(Arc<Mutex<RepoState>>);

impl FakeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.0
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), data.into());
    }

    /// Serve bytes that fail verification against the signed metadata.
    pub fn set_tamper(&self, tamper: bool) {
        self.0.lock().unwrap().tamper = tamper;
    }

    pub fn set_update(&self, behavior: UpdateBehavior) {
        self.0.lock().unwrap().update = behavior;
    }

    /// Trip `token` after the first chunk of the next transfer.
    pub fn cancel_mid_transfer(&self, token: CancelToken) {
        self.0.lock().unwrap().cancel_mid_transfer = Some(token);
    }

    pub fn downloads(&self) -> Vec<String> {
        self.0.lock().unwrap().downloads.clone()
    }

    pub fn download_count(&self) -> usize {
        self.0.lock().unwrap().downloads.len()
    }

    pub fn lookups(&self) -> Vec<String> {
        self.0.lock().unwrap().lookups.clone()
    }

    /// `(key count, root version)` of every `init` call.
    pub fn init_calls(&self) -> Vec<(usize, u32)> {
        self.0.lock().unwrap().init_calls.clone()
    }

    pub fn client(&self) -> Box<dyn MetadataClient> {
        Box::new(FakeClient(self.clone()))
    }
}

struct FakeClient(FakeRepository);

impl MetadataClient for FakeClient {
    fn init(&mut self, root_keys: &[PublicKey], version: u32) -> Result<(), MetadataError> {
        let mut state = (self.0).0.lock().unwrap();
        state.init_calls.push((root_keys.len(), version));
        Ok(())
    }

    fn update(&mut self) -> Result<(), MetadataError> {
        match (self.0).0.lock().unwrap().update {
            UpdateBehavior::Updated => Ok(()),
            UpdateBehavior::Latest => Err(MetadataError::LatestSnapshot),
            UpdateBehavior::Fail => Err(MetadataError::Verification(
                "timestamp metadata expired".to_string(),
            )),
        }
    }

    fn target(&self, path: &str) -> Result<TargetFileMeta, MetadataError> {
        let mut state = (self.0).0.lock().unwrap();
        state.lookups.push(path.to_string());
        state
            .files
            .get(path)
            .map(|data| meta_for_bytes(data))
            .ok_or_else(|| MetadataError::NotFound(path.to_string()))
    }

    fn targets(&self) -> Result<TargetFiles, MetadataError> {
        let state = (self.0).0.lock().unwrap();
        Ok(state
            .files
            .iter()
            .map(|(path, data)| (path.clone(), meta_for_bytes(data)))
            .collect())
    }

    fn download(&mut self, path: &str, dest: &mut dyn Destination) -> Result<(), MetadataError> {
        let (data, tamper, cancel) = {
            let mut state = (self.0).0.lock().unwrap();
            state.downloads.push(path.to_string());
            let data = state
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| MetadataError::NotFound(path.to_string()))?;
            (data, state.tamper, state.cancel_mid_transfer.take())
        };

        let served = if tamper {
            let mut bad = data.clone();
            bad.push(b'!');
            bad
        } else {
            data.clone()
        };

        for (i, chunk) in served.chunks(4).enumerate() {
            dest.write_all(chunk)?;
            if i == 0 {
                if let Some(token) = &cancel {
                    token.cancel();
                }
            }
        }

        if served != data {
            dest.delete()?;
            return Err(MetadataError::WrongHash(path.to_string()));
        }
        Ok(())
    }
}

// =========================================================================
// Commands
// =========================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCall {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Whether `program` existed as a file when it was run.
    pub existed: bool,
}

#[derive(Default)]
struct RunnerState {
    calls: Vec<RunCall>,
    fail_with: Option<String>,
}

/// Records commands instead of running them.
#[derive(Clone, Default)]
pub struct FakeRunner {
    state: Arc<Mutex<RunnerState>>,
    found: Vec<String>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Programs `lookup` reports as installed under `/usr/bin`.
    pub fn with_programs(mut self, programs: &[&str]) -> Self {
        self.found = programs.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Make every following command exit non-zero with `output`.
    pub fn fail_with(&self, output: &str) {
        self.state.lock().unwrap().fail_with = Some(output.to_string());
    }

    pub fn calls(&self) -> Vec<RunCall> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, program: &Path, args: &[&str]) -> io::Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RunCall {
            program: program.to_path_buf(),
            args: args.iter().map(|a| a.to_string()).collect(),
            existed: program.is_file(),
        });
        Ok(match &state.fail_with {
            Some(output) => CommandOutput::failed(1, output.clone()),
            None => CommandOutput::ok("usage: agent [flags]"),
        })
    }

    fn lookup(&self, program: &str) -> Option<PathBuf> {
        self.found
            .iter()
            .any(|p| p == program)
            .then(|| PathBuf::from("/usr/bin").join(program))
    }
}

// =========================================================================
// Fixtures
// =========================================================================

pub fn host(os: HostOs) -> HostEnv {
    HostEnv {
        os,
        system_root: PathBuf::from("/"),
        executable: PathBuf::from("/usr/local/bin/stagehand-test"),
    }
}

pub enum TarEntry<'a> {
    File(&'a str, &'a [u8]),
    Dir(&'a str),
    /// Written without path validation, for hostile names.
    Raw(&'a str, &'a [u8]),
}

/// Build a `.tar.gz` in memory. Files are executable.
pub fn tar_gz(entries: &[TarEntry<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        match entry {
            TarEntry::File(name, data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_path(name).unwrap();
                header.set_mode(0o755);
                header.set_size(data.len() as u64);
                header.set_cksum();
                builder.append(&header, *data).unwrap();
            }
            TarEntry::Dir(name) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_path(name).unwrap();
                header.set_mode(0o755);
                header.set_size(0);
                header.set_cksum();
                builder.append(&header, io::empty()).unwrap();
            }
            TarEntry::Raw(name, data) => {
                let bytes = name.as_bytes();
                header.as_old_mut().name[..bytes.len()].copy_from_slice(bytes);
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                header.set_cksum();
                builder.append(&header, *data).unwrap();
            }
        }
    }
    builder.into_inner().unwrap().finish().unwrap()
}
