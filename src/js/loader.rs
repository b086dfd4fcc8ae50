//! Module resolution and fetching for `import` statements inside a sandbox.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Error as JsError, Module};
use url::Url;

use crate::log::{ViolationKind, ViolationLog};

pub const DEFAULT_MODULE_ORIGIN: &str = "https://esm.sh/";

/// Name under which the sandbox's own source is evaluated.
pub const ENTRY_MODULE_NAME: &str = "sandbox:main";

/// Resolves specifiers to module names and produces their source text.
pub trait ModuleLoader {
    fn resolve(&self, referrer: &str, specifier: &str) -> Result<String>;
    fn load(&self, name: &str) -> Result<String>;
}

/// Produces the text behind an absolute URL.
pub trait ModuleFetcher {
    fn fetch(&self, url: &Url) -> Result<String>;
}

/// HTTPS fetcher.
///
/// `fetch` blocks the calling thread until the response arrives. QuickJS asks
/// for module source synchronously while an `import` is being linked, so
/// there is no point at which the sandbox could yield to the runtime. The
/// client is built and used on a short-lived thread because the blocking
/// client panics when created or used on a thread driving a tokio runtime.
pub struct HttpFetcher {
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleFetcher for HttpFetcher {
    fn fetch(&self, url: &Url) -> Result<String> {
        let timeout = self.timeout;
        let target = url.clone();
        std::thread::spawn(move || -> Result<String> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .context("failed to build module HTTP client")?;
            let response = client
                .get(target.clone())
                .send()
                .with_context(|| format!("failed to fetch module {target}"))?
                .error_for_status()
                .with_context(|| format!("module request for {target} failed"))?;
            response
                .text()
                .with_context(|| format!("failed to read module body from {target}"))
        })
        .join()
        .map_err(|_| anyhow!("module fetch thread for {url} panicked"))?
    }
}

/// Default loader: every import must resolve inside one trusted origin.
/// Fetched sources are cached by resolved URL for the loader's lifetime.
pub struct TrustedOriginLoader {
    origin: Url,
    fetcher: Box<dyn ModuleFetcher>,
    cache: RefCell<HashMap<String, String>>,
    violations: ViolationLog,
}

impl TrustedOriginLoader {
    pub fn new(origin: Url, fetcher: Box<dyn ModuleFetcher>, violations: ViolationLog) -> Self {
        Self {
            origin,
            fetcher,
            cache: RefCell::new(HashMap::new()),
            violations,
        }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn cached_len(&self) -> usize {
        self.cache.borrow().len()
    }

    fn reject(&self, specifier: &str) -> anyhow::Error {
        let message = format!("Invalid import \"{specifier}\"");
        self.violations.record(ViolationKind::Import, message.clone());
        anyhow!(message)
    }
}

impl ModuleLoader for TrustedOriginLoader {
    fn resolve(&self, referrer: &str, specifier: &str) -> Result<String> {
        let base = match Url::parse(referrer) {
            Ok(base) if base.origin() == self.origin.origin() => base,
            _ => self.origin.clone(),
        };
        let resolved = base
            .join(specifier)
            .map_err(|_| self.reject(specifier))?;
        if resolved.origin() != self.origin.origin() {
            return Err(self.reject(specifier));
        }
        Ok(resolved.to_string())
    }

    fn load(&self, name: &str) -> Result<String> {
        if let Some(source) = self.cache.borrow().get(name) {
            tracing::debug!(target: "sandbox::loader", url = name, "cache hit");
            return Ok(source.clone());
        }

        let url = Url::parse(name).map_err(|_| self.reject(name))?;
        if url.origin() != self.origin.origin() {
            return Err(self.reject(name));
        }

        tracing::debug!(target: "sandbox::loader", url = name, "fetching module");
        let source = self.fetcher.fetch(&url)?;
        self.cache
            .borrow_mut()
            .insert(name.to_string(), source.clone());
        Ok(source)
    }
}

/// Adapter installing a [`ModuleLoader`] into the QuickJS runtime.
#[derive(Clone)]
pub struct RuntimeModuleLoader {
    inner: Rc<dyn ModuleLoader>,
}

impl RuntimeModuleLoader {
    pub fn new(inner: Rc<dyn ModuleLoader>) -> Self {
        Self { inner }
    }
}

impl Resolver for RuntimeModuleLoader {
    fn resolve<'js>(&mut self, _ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        self.inner.resolve(base, name).map_err(|err| {
            tracing::warn!(target: "sandbox::loader", base, name, "resolution failed: {err}");
            JsError::new_resolving_message(base, name, err.to_string())
        })
    }
}

impl Loader for RuntimeModuleLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let source = self.inner.load(name).map_err(|err| {
            tracing::warn!(target: "sandbox::loader", name, "load failed: {err:#}");
            JsError::new_loading_message(name, format!("{err:#}"))
        })?;
        Module::declare(ctx.clone(), name, source)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use super::*;

    struct CountingFetcher {
        calls: Rc<Cell<usize>>,
    }

    impl ModuleFetcher for CountingFetcher {
        fn fetch(&self, url: &Url) -> Result<String> {
            self.calls.set(self.calls.get() + 1);
            Ok(format!("export default {:?};", url.as_str()))
        }
    }

    fn loader(calls: &Rc<Cell<usize>>, log: &ViolationLog) -> TrustedOriginLoader {
        TrustedOriginLoader::new(
            Url::parse(DEFAULT_MODULE_ORIGIN).unwrap(),
            Box::new(CountingFetcher {
                calls: Rc::clone(calls),
            }),
            log.clone(),
        )
    }

    #[test]
    fn bare_specifiers_resolve_against_origin() {
        let loader = loader(&Rc::new(Cell::new(0)), &ViolationLog::new());
        assert_eq!(
            loader.resolve(ENTRY_MODULE_NAME, "react@18").unwrap(),
            "https://esm.sh/react@18"
        );
        assert_eq!(
            loader
                .resolve("https://esm.sh/react@18/index.js", "./client.js")
                .unwrap(),
            "https://esm.sh/react@18/client.js"
        );
    }

    #[test]
    fn foreign_origins_are_rejected() {
        let log = ViolationLog::new();
        let loader = loader(&Rc::new(Cell::new(0)), &log);
        let err = loader
            .resolve(ENTRY_MODULE_NAME, "https://evil.example/x.js")
            .unwrap_err();
        assert!(err.to_string().contains("Invalid import"));
        assert!(loader.resolve(ENTRY_MODULE_NAME, "//evil.example/x.js").is_err());
        assert_eq!(log.count_of(ViolationKind::Import), 2);
    }

    #[test]
    fn fetches_are_cached_by_url() {
        let calls = Rc::new(Cell::new(0));
        let loader = loader(&calls, &ViolationLog::new());
        let first = loader.load("https://esm.sh/a.js").unwrap();
        let second = loader.load("https://esm.sh/a.js").unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
        assert_eq!(loader.cached_len(), 1);
    }

    #[tokio::test]
    async fn http_fetch_works_from_inside_the_runtime() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 2048];
            let _ = stream.read(&mut request).unwrap();
            let body = "export default 1;";
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Type: text/javascript\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .unwrap();
        });

        let fetcher = HttpFetcher::new();
        let url = Url::parse(&format!("http://{address}/mod.js")).unwrap();
        assert_eq!(fetcher.fetch(&url).unwrap(), "export default 1;");
        server.join().unwrap();
    }
}
