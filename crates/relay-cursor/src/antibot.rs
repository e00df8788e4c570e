//! Anti-bot token minting.
//!
//! Fetches the remote challenge script with a browser-like header set,
//! splices it into a fixed host program alongside the fingerprint constants,
//! and evaluates the result in a throwaway QuickJS sandbox with no host
//! bindings. One runtime per call; nothing persists between invocations.

use std::time::{Duration, Instant};

use relay_core::CursorSettings;
use rquickjs::{Context, Runtime};
use thiserror::Error;
use tracing::debug;

/// Header block presented on the script fetch.
pub(crate) const SEC_CH_UA: &str =
    "\"Not/A)Brand\";v=\"8\", \"Chromium\";v=\"126\", \"Google Chrome\";v=\"126\"";
const SCRIPT_REFERER: &str = "https://cursor.com/";

const SANDBOX_MEMORY_LIMIT: usize = 64 * 1024 * 1024;
const SANDBOX_STACK_LIMIT: usize = 1024 * 1024;
const SANDBOX_DEADLINE: Duration = Duration::from_secs(2);

/// Stub browser APIs available before the challenge script runs.
const ENV_PRELUDE: &str = r#"
var performance = { now: function () { return Date.now(); } };
var screen = { width: 1920, height: 1080, colorDepth: 24 };
"#;

/// Host program; placeholders are spliced by [`compose_program`].
const HOST_TEMPLATE: &str = r#""use strict";
var window = globalThis;
var self = globalThis;
var navigator = {
  userAgent: "__USER_AGENT__",
  language: "en-US",
  languages: ["en-US", "en"],
  platform: "Win32",
  webdriver: false,
  hardwareConcurrency: 8,
};
var UNMASKED_VENDOR_WEBGL = 37445;
var UNMASKED_RENDERER_WEBGL = 37446;
var document = {
  currentScript: { src: "__SCRIPT_URL__" },
  createElement: function (tag) {
    if (tag !== "canvas") { return {}; }
    return {
      getContext: function () {
        return {
          getExtension: function (name) {
            if (name === "WEBGL_debug_renderer_info") {
              return {
                UNMASKED_VENDOR_WEBGL: UNMASKED_VENDOR_WEBGL,
                UNMASKED_RENDERER_WEBGL: UNMASKED_RENDERER_WEBGL,
              };
            }
            return null;
          },
          getParameter: function (parameter) {
            if (parameter === UNMASKED_VENDOR_WEBGL) { return "__WEBGL_VENDOR__"; }
            if (parameter === UNMASKED_RENDERER_WEBGL) { return "__WEBGL_RENDERER__"; }
            return null;
          },
        };
      },
    };
  },
};
var location = { href: "https://cursor.com/", origin: "https://cursor.com" };
__ENV_PRELUDE__
__CURSOR_SCRIPT__
(function () {
  if (typeof window.__is_human__ === "function") {
    return String(window.__is_human__());
  }
  if (typeof globalThis.getIsHumanToken === "function") {
    return String(globalThis.getIsHumanToken());
  }
  throw new Error("anti-bot entry point not found");
})()
"#;

/// Failures while minting an `x-is-human` token.
#[derive(Debug, Error)]
pub enum AntiBotError {
    #[error("challenge script fetch returned status {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("challenge script fetch failed: {0}")]
    Fetch(String),
    #[error("challenge script execution failed: {0}")]
    Script(String),
}

/// Stateless token minter; safe to call concurrently.
pub struct AntiBotEngine {
    client: reqwest::Client,
    settings: CursorSettings,
}

impl AntiBotEngine {
    pub fn new(settings: CursorSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    /// Mints one `x-is-human` token.
    pub async fn fetch_token(&self) -> Result<String, AntiBotError> {
        let response = self
            .client
            .get(&self.settings.script_url)
            .header("User-Agent", &self.settings.user_agent)
            .header("sec-ch-ua", SEC_CH_UA)
            .header("sec-ch-ua-mobile", "?0")
            .header("sec-ch-ua-platform", "\"Windows\"")
            .header("Referer", SCRIPT_REFERER)
            .header("Accept", "*/*")
            .send()
            .await
            .map_err(|error| AntiBotError::Fetch(error.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|error| AntiBotError::Fetch(error.to_string()))?;
        if status != 200 {
            return Err(AntiBotError::Upstream { status, body });
        }

        let program = compose_program(&self.settings, &body);
        debug!(bytes = program.len(), "anti-bot program composed");

        // QuickJS is synchronous; keep it off the async workers.
        tokio::task::spawn_blocking(move || execute_program(program))
            .await
            .map_err(|error| AntiBotError::Script(format!("sandbox task failed: {error}")))?
    }
}

/// Splices the fetched script and fingerprint constants into the host
/// program by plain textual substitution.
pub(crate) fn compose_program(settings: &CursorSettings, cursor_script: &str) -> String {
    HOST_TEMPLATE
        .replace("__SCRIPT_URL__", &settings.script_url)
        .replace("__WEBGL_VENDOR__", &settings.webgl_vendor)
        .replace("__WEBGL_RENDERER__", &settings.webgl_renderer)
        .replace("__USER_AGENT__", &settings.user_agent)
        .replace("__ENV_PRELUDE__", ENV_PRELUDE)
        .replace("__CURSOR_SCRIPT__", cursor_script)
}

/// Runs the composed program in a bounded, throwaway QuickJS runtime.
fn execute_program(program: String) -> Result<String, AntiBotError> {
    let runtime = Runtime::new().map_err(|error| AntiBotError::Script(error.to_string()))?;
    runtime.set_memory_limit(SANDBOX_MEMORY_LIMIT);
    runtime.set_max_stack_size(SANDBOX_STACK_LIMIT);
    let deadline = Instant::now() + SANDBOX_DEADLINE;
    runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));

    let context = Context::full(&runtime).map_err(|error| AntiBotError::Script(error.to_string()))?;
    context.with(|ctx| {
        ctx.eval::<String, _>(program).map_err(|error| match error {
            rquickjs::Error::Exception => {
                let thrown = ctx.catch();
                AntiBotError::Script(format!("{thrown:?}"))
            }
            other => AntiBotError::Script(other.to_string()),
        })
    })
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;

    fn settings(script_url: String) -> CursorSettings {
        CursorSettings {
            script_url,
            ..CursorSettings::default()
        }
    }

    #[test]
    fn unit_compose_substitutes_every_placeholder() {
        let composed = compose_program(
            &settings("https://cursor.example/c.js".to_string()),
            "var marker = 1;",
        );
        assert!(composed.contains("https://cursor.example/c.js"));
        assert!(composed.contains("var marker = 1;"));
        assert!(!composed.contains("__CURSOR_SCRIPT__"));
        assert!(!composed.contains("__USER_AGENT__"));
        assert!(!composed.contains("__ENV_PRELUDE__"));
    }

    #[test]
    fn functional_sandbox_runs_a_challenge_that_reads_the_fingerprint() {
        let script = r#"
            window.__is_human__ = function () {
                var gl = document.createElement("canvas").getContext("webgl");
                gl.getExtension("WEBGL_debug_renderer_info");
                return "tok-" + gl.getParameter(UNMASKED_VENDOR_WEBGL).length
                    + "-" + navigator.userAgent.length;
            };
        "#;
        let mut config = settings("https://cursor.example/c.js".to_string());
        config.webgl_vendor = "Vendor".to_string();
        config.user_agent = "UA".to_string();
        let token = execute_program(compose_program(&config, script)).expect("token");
        assert_eq!(token, "tok-6-2");
    }

    #[test]
    fn unit_script_throw_surfaces_as_execution_error() {
        let config = settings("https://cursor.example/c.js".to_string());
        let result = execute_program(compose_program(&config, "throw new Error('nope');"));
        assert!(matches!(result, Err(AntiBotError::Script(_))));
    }

    #[test]
    fn unit_missing_entry_point_is_an_execution_error() {
        let config = settings("https://cursor.example/c.js".to_string());
        let result = execute_program(compose_program(&config, "var benign = true;"));
        match result {
            Err(AntiBotError::Script(message)) => {
                assert!(message.contains("entry point"), "got: {message}");
            }
            other => panic!("expected script error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn functional_fetch_token_end_to_end_against_a_mock_origin() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/challenge.js")
                    .header("sec-ch-ua-platform", "\"Windows\"");
                then.status(200)
                    .body("window.__is_human__ = function () { return \"x-is-human-ok\"; };");
            })
            .await;

        let engine = AntiBotEngine::new(settings(format!("{}/challenge.js", server.base_url())));
        let token = engine.fetch_token().await.expect("token");
        assert_eq!(token, "x-is-human-ok");
    }

    #[tokio::test]
    async fn regression_non_200_fetch_maps_to_upstream_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/challenge.js");
                then.status(403).body("blocked");
            })
            .await;

        let engine = AntiBotEngine::new(settings(format!("{}/challenge.js", server.base_url())));
        match engine.fetch_token().await {
            Err(AntiBotError::Upstream { status, body }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "blocked");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }
}
