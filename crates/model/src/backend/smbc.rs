//! Windows (SMB/CIFS) shares.
//!
//! A share is read through the kernel's CIFS client: opening the source
//! mounts it read-only below a temporary directory, and closing it unmounts
//! it again. A share that is already mounted can be named instead with
//! `mount_point`. Once mounted, walking and reading work as for local files.

use crate::backend::file::{LocalResource, LocalRoot, Walker};
use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::manager::SourceManager;
use crate::registry::{Registry, opt_bool, opt_str, str_field};
use crate::resource::Resource;
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use futures::StreamExt;
use serde_json::{Map, Value, json};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;

pub const LABEL: &str = "smbc";

#[derive(Clone, Debug)]
pub struct SmbcSource {
    /// `//server/share[/folder]`, always with forward slashes.
    unc: String,
    user: Option<String>,
    password: Option<String>,
    domain: Option<String>,
    driveletter: Option<String>,
    skip_super_hidden: bool,
    mount_point: Option<PathBuf>,
}

/// The authentication domain implied by a fully qualified server name.
/// NetBIOS names and IP addresses imply none.
fn compute_domain(unc: &str) -> Option<String> {
    let server = unc.trim_start_matches('/').split('/').next()?;
    let dots = server.matches('.').count();
    let ipv4 = dots == 3 && server.chars().all(|c| c.is_ascii_digit() || c == '.');
    if server.starts_with('[') || dots == 0 || ipv4 {
        return None;
    }
    server.split_once('.').map(|(_, domain)| domain.to_string())
}

/// Names never worth walking into: snapshot directories and Office lock
/// files.
fn is_noise(name: &str) -> bool {
    name == "~snapshot" || name.starts_with("~$")
}

fn is_noise_or_hidden(name: &str) -> bool {
    is_noise(name) || name.starts_with('.')
}

impl SmbcSource {
    pub fn new(unc: impl Into<String>) -> Self {
        let unc = unc.into().replace('\\', "/");
        let domain = compute_domain(&unc);
        Self { unc, user: None, password: None, domain, driveletter: None, skip_super_hidden: false, mount_point: None }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_driveletter(mut self, driveletter: impl Into<String>) -> Self {
        self.driveletter = Some(driveletter.into().replace('\\', "/"));
        self
    }

    pub fn skip_super_hidden(mut self, skip: bool) -> Self {
        self.skip_super_hidden = skip;
        self
    }

    /// Reads an already mounted share at `path` instead of mounting it.
    pub fn with_mount_point(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_point = Some(path.into());
        self
    }

    fn decode(obj: &Map<String, Value>, _: &Registry) -> Result<SourceRef> {
        let mut source = Self::new(str_field(obj, "unc")?);
        source.user = opt_str(obj, "user");
        source.password = opt_str(obj, "password");
        if let Some(domain) = opt_str(obj, "domain") {
            source.domain = Some(domain);
        }
        source.driveletter = opt_str(obj, "driveletter").map(|d| d.replace('\\', "/"));
        source.skip_super_hidden = opt_bool(obj, "skip_super_hidden", false);
        source.mount_point = opt_str(obj, "mount_point").map(PathBuf::from);
        Ok(Arc::new(source))
    }

    /// The Windows path of `relative_path`, under the drive letter if the
    /// share has one.
    fn windows_path(&self, relative_path: &str) -> String {
        let mut prefix = match &self.driveletter {
            Some(letter) if letter.contains(':') => letter.clone(),
            Some(letter) => format!("{letter}:"),
            None => self.unc.clone(),
        };
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        format!("{prefix}{relative_path}").replace('/', "\\")
    }

    /// A `mount.cifs` credentials file, so the password stays off the
    /// command line.
    fn credentials_file(&self) -> Result<Option<tempfile::NamedTempFile>> {
        let Some(user) = &self.user else {
            return Ok(None);
        };
        let mut file = tempfile::NamedTempFile::new().or_raise(|| ErrorKind::Unavailable(self.unc.clone()))?;
        let mut contents = format!("username={user}\npassword={}\n", self.password.as_deref().unwrap_or_default());
        if let Some(domain) = &self.domain {
            contents.push_str(&format!("domain={domain}\n"));
        }
        file.write_all(contents.as_bytes()).or_raise(|| ErrorKind::Unavailable(self.unc.clone()))?;
        Ok(Some(file))
    }

    #[tracing::instrument(skip(self), fields(unc = %self.unc))]
    async fn mount(&self) -> Result<Opened> {
        let dir = tempfile::Builder::new().prefix("trawl-smb").tempdir().or_raise(|| ErrorKind::Unavailable(self.unc.clone()))?;
        let credentials = self.credentials_file()?;
        let options = match &credentials {
            Some(file) => format!("ro,credentials={}", file.path().display()),
            None => "ro,guest".to_string(),
        };
        let output = Command::new("mount")
            .args(["-t", "cifs", &self.unc])
            .arg(dir.path())
            .args(["-o", &options])
            .output()
            .await
            .or_raise(|| ErrorKind::Unavailable(format!("{}: cannot run mount", self.unc)))?;
        drop(credentials);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            exn::bail!(ErrorKind::Unavailable(format!("{}: {}", self.unc, stderr.trim())));
        }
        tracing::debug!(path = %dir.path().display(), "mounted share");
        let root = LocalRoot(dir.path().to_path_buf());
        Ok(Opened::new(root).with_close(move || {
            let unmounted = std::process::Command::new("umount").arg(dir.path()).status();
            match unmounted {
                Ok(status) if status.success() => drop(dir),
                result => {
                    // Removing a directory that is still a mount would delete
                    // files on the share.
                    tracing::warn!(path = %dir.path().display(), ?result, "could not unmount share");
                    let _ = dir.keep();
                }
            }
        }))
    }
}

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(LABEL, SmbcSource::decode);
}

#[async_trait]
impl Source for SmbcSource {
    fn type_label(&self) -> &'static str {
        LABEL
    }

    fn eq_properties(&self) -> Value {
        json!({"unc": self.unc, "user": self.user, "domain": self.domain})
    }

    fn censor(&self) -> SourceRef {
        Arc::new(Self { password: None, ..self.clone() })
    }

    fn to_json(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert("unc".into(), self.unc.clone().into());
        obj.insert("user".into(), self.user.clone().into());
        obj.insert("password".into(), self.password.clone().into());
        obj.insert("domain".into(), self.domain.clone().into());
        obj.insert("driveletter".into(), self.driveletter.clone().into());
        obj.insert("skip_super_hidden".into(), self.skip_super_hidden.into());
        if let Some(mount_point) = &self.mount_point {
            obj.insert("mount_point".into(), mount_point.to_string_lossy().into());
        }
        obj
    }

    async fn open(&self, _sm: &SourceManager) -> Result<Opened> {
        match &self.mount_point {
            Some(path) => Ok(Opened::new(LocalRoot(path.clone()))),
            None => self.mount().await,
        }
    }

    fn handles<'a>(self: Arc<Self>, sm: &'a SourceManager, rule: Option<&'a Rule>) -> HandleStream<'a> {
        let cutoff = rule.and_then(Rule::last_modified_cutoff);
        Box::pin(stream! {
            let root = match sm.open_as::<LocalRoot>(self.as_ref()).await {
                Ok(root) => root,
                Err(e) => { yield Err(e); return; }
            };
            let skip: fn(&str) -> bool = if self.skip_super_hidden { is_noise_or_hidden } else { is_noise };
            let walker = Walker { root: root.0.clone(), cutoff, skip };
            let mut handles = walker.walk(self.clone());
            while let Some(handle) = handles.next().await {
                yield handle;
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(LocalResource::new(handle.clone(), sm))
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        let path = self.windows_path(&handle.relative_path);
        path.rsplit('\\').next().unwrap_or_default().to_string()
    }

    fn presentation_place(&self, handle: &Handle) -> String {
        let path = self.windows_path(&handle.relative_path);
        path.rsplit_once('\\').map(|(parent, _)| parent.to_string()).unwrap_or_default()
    }

    /// A `file:` URL, which Windows clients open directly.
    fn presentation_url(&self, handle: &Handle) -> Option<String> {
        let base = self.unc.trim_end_matches('/');
        Some(format!("file:{base}/{}", handle.relative_path))
    }

    fn sort_key(&self, handle: &Handle) -> String {
        self.windows_path(&handle.relative_path).trim_end_matches('\\').to_string()
    }
}
