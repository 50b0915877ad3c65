use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

use stampede_core::http::HttpConfig;
use stampede_core::{
    Archive, Error as CoreError, Group, HttpClient, Options, Runner, SampleSink, SourceData, Vu,
};

use crate::modules::RegisterContext;
use crate::vu::{LuaVu, build_script_state};
use crate::{Error, Result, options};

/// The Lua-backed [`Runner`]: compiles the script once at construction to
/// catch errors before any VU exists, then mints a private interpreter per
/// VU.
#[derive(Debug)]
pub struct LuaRunner {
    script: Arc<str>,
    chunk_name: Arc<str>,
    script_options: Options,
    effective: Mutex<Options>,
    group: Arc<Group>,
    env: Arc<Vec<(String, String)>>,
    client: Mutex<Option<Arc<HttpClient>>>,
}

impl LuaRunner {
    pub fn new(src: &SourceData, env: Vec<(String, String)>) -> Result<LuaRunner> {
        let script = std::str::from_utf8(&src.data).map_err(|_| Error::InvalidUtf8)?;
        let chunk_name = chunk_name(&src.filename);
        Self::build(script, &chunk_name, None, env)
    }

    /// Builds from a sealed archive: the embedded entry script plus the
    /// options frozen at archive time.
    pub fn from_archive(archive: &Archive, env: Vec<(String, String)>) -> Result<LuaRunner> {
        let data = archive.entry_data().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("archive is missing its entry file `{}`", archive.filename),
            ))
        })?;
        let script = std::str::from_utf8(data).map_err(|_| Error::InvalidUtf8)?;
        let chunk_name = chunk_name(&archive.filename);
        Self::build(script, &chunk_name, Some(archive.options.clone()), env)
    }

    fn build(
        script: &str,
        chunk_name: &str,
        sealed_options: Option<Options>,
        env: Vec<(String, String)>,
    ) -> Result<LuaRunner> {
        let env = Arc::new(env);
        let group = Group::root();

        // Compile check: build a throwaway state exactly the way a VU would,
        // so top-level `require`s and the entry function are verified before
        // the run starts. Its samples go nowhere.
        let (probe_sink, _probe_rx) = SampleSink::channel();
        let probe_ctx = RegisterContext {
            vu_id: 0,
            sink: probe_sink,
            client: Arc::new(HttpClient::default()),
            root: group.clone(),
            env: env.clone(),
        };
        let probe = build_script_state(script, chunk_name, probe_ctx)?;

        let script_options = match sealed_options {
            Some(options) => options,
            None => options::read_options_table(&probe.lua)?,
        };

        Ok(LuaRunner {
            script: Arc::from(script),
            chunk_name: Arc::from(chunk_name),
            effective: Mutex::new(script_options.clone()),
            script_options,
            group,
            env,
            client: Mutex::new(None),
        })
    }

    fn client(&self) -> Arc<HttpClient> {
        let mut client = self.client.lock();
        if let Some(existing) = client.as_ref() {
            return existing.clone();
        }

        let effective = self.effective.lock().clone();
        let mut cfg = HttpConfig::default();
        if let Some(max_redirects) = effective.max_redirects {
            cfg.max_redirects = max_redirects;
        }
        if let Some(skip) = effective.insecure_skip_tls_verify {
            cfg.insecure_skip_tls_verify = skip;
        }
        if let Some(user_agent) = effective.user_agent {
            cfg.user_agent = user_agent;
        }

        let built = Arc::new(HttpClient::new(cfg));
        *client = Some(built.clone());
        built
    }
}

impl Runner for LuaRunner {
    fn new_vu(&self, sink: SampleSink) -> std::result::Result<Box<dyn Vu>, CoreError> {
        Ok(Box::new(LuaVu {
            script: self.script.clone(),
            chunk_name: self.chunk_name.clone(),
            client: self.client(),
            root: self.group.clone(),
            env: self.env.clone(),
            sink,
            state: None,
        }))
    }

    fn options(&self) -> Options {
        self.script_options.clone()
    }

    fn set_options(&self, options: Options) {
        *self.effective.lock() = options;
        // The HTTP client derives from the options; rebuild on next mint.
        *self.client.lock() = None;
    }

    fn default_group(&self) -> Arc<Group> {
        self.group.clone()
    }
}

fn chunk_name(filename: &str) -> String {
    if filename == "-" {
        return "stdin".to_string();
    }
    Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string())
}
