use axum::{
    body::Body,
    http::{header, HeaderValue, Response, StatusCode},
};
use percent_encoding::percent_decode_str;

use crate::config::Config;

pub const INTERCEPTOR_PATH: &str = "/__divortio_interceptor.js";
pub const SERVICE_WORKER_PATH: &str = "/__divortio_sw.js";
pub const SW_INJECTOR_PATH: &str = "/__divortio_sw_injector.js";

/// Client-side interceptor. The core treats this source as an opaque
/// payload; only the root-domain parameter is substituted in.
const INTERCEPTOR_TEMPLATE: &str = r#"(() => {
  'use strict';
  if (self.__d_rw) { return; }
  const ROOT = (self.__CFG__ && self.__CFG__.rootDomain) || '__ROOT_DOMAIN__';
  const SUFFIX = '.' + ROOT;

  const rewrite = (input) => {
    try {
      const url = new URL(input, self.location.href);
      if (url.hostname === ROOT || url.hostname.endsWith(SUFFIX)) { return input; }
      if (url.protocol === 'http:' || url.protocol === 'https:') {
        url.protocol = 'https:';
      } else if (url.protocol === 'ws:' || url.protocol === 'wss:') {
        url.protocol = 'wss:';
      } else {
        return input;
      }
      url.hostname = url.hostname + SUFFIX;
      return url.toString();
    } catch (_) {
      return input;
    }
  };
  self.__d_rw = rewrite;

  const nativeFetch = self.fetch;
  self.fetch = function (resource, init) {
    if (typeof resource === 'string' || resource instanceof URL) {
      return nativeFetch.call(self, rewrite(String(resource)), init);
    }
    if (resource instanceof Request) {
      return nativeFetch.call(self, new Request(rewrite(resource.url), resource), init);
    }
    return nativeFetch.call(self, resource, init);
  };

  const nativeOpen = XMLHttpRequest.prototype.open;
  XMLHttpRequest.prototype.open = function (method, url, ...rest) {
    return nativeOpen.call(this, method, rewrite(String(url)), ...rest);
  };

  const NativeWebSocket = self.WebSocket;
  self.WebSocket = function (url, protocols) {
    return protocols === undefined
      ? new NativeWebSocket(rewrite(String(url)))
      : new NativeWebSocket(rewrite(String(url)), protocols);
  };
  self.WebSocket.prototype = NativeWebSocket.prototype;

  if (self.navigator && navigator.serviceWorker) {
    const nativeRegister = navigator.serviceWorker.register.bind(navigator.serviceWorker);
    navigator.serviceWorker.register = (url, options) =>
      nativeRegister('/__divortio_sw_injector.js?target=' + encodeURIComponent(String(url)), options);
  }
})();
"#;

/// The proxy's own service worker: re-routes fetches that escaped the
/// in-page interceptor.
const SERVICE_WORKER_TEMPLATE: &str = r#"'use strict';
const ROOT = '__ROOT_DOMAIN__';
const SUFFIX = '.' + ROOT;

self.addEventListener('install', () => self.skipWaiting());
self.addEventListener('activate', (event) => event.waitUntil(clients.claim()));

self.addEventListener('fetch', (event) => {
  const url = new URL(event.request.url);
  if (url.hostname === ROOT || url.hostname.endsWith(SUFFIX)) { return; }
  if (url.protocol !== 'http:' && url.protocol !== 'https:') { return; }
  url.protocol = 'https:';
  url.hostname = url.hostname + SUFFIX;
  event.respondWith(fetch(new Request(url.toString(), event.request)));
});
"#;

/// Generate the interceptor source for this deployment.
pub fn interceptor_source(root_domain: &str) -> String {
    INTERCEPTOR_TEMPLATE.replace("__ROOT_DOMAIN__", root_domain)
}

/// Generate the service-worker source for this deployment.
pub fn service_worker_source(root_domain: &str) -> String {
    SERVICE_WORKER_TEMPLATE.replace("__ROOT_DOMAIN__", root_domain)
}

/// Generate the injector wrapper: load the interceptor first, then pull in
/// the site's own service worker through the proxy.
pub fn sw_injector_source(root_domain: &str, target: &str) -> String {
    format!(
        "importScripts('{}');\nimportScripts(self.__d_rw({}));\n// root: {}\n",
        INTERCEPTOR_PATH,
        serde_json::to_string(target).unwrap_or_else(|_| "''".to_string()),
        root_domain,
    )
}

/// Serve the generated script endpoints. Returns `None` when the path is not
/// an asset endpoint.
pub fn handle(path: &str, query: Option<&str>, config: &Config) -> Option<Response<Body>> {
    match path {
        INTERCEPTOR_PATH => Some(script_response(
            interceptor_source(&config.root_domain),
            "public, max-age=43200",
            false,
        )),
        SERVICE_WORKER_PATH => Some(script_response(
            service_worker_source(&config.root_domain),
            "no-cache",
            true,
        )),
        SW_INJECTOR_PATH => {
            if !config.features.service_worker {
                return Some(plain_response(StatusCode::NOT_FOUND, "service worker disabled"));
            }
            match query.and_then(injector_target) {
                Some(target) => Some(script_response(
                    sw_injector_source(&config.root_domain, &target),
                    "no-cache",
                    true,
                )),
                None => Some(plain_response(
                    StatusCode::BAD_REQUEST,
                    "missing target parameter",
                )),
            }
        }
        _ => None,
    }
}

fn injector_target(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let encoded = pair.strip_prefix("target=")?;
        if encoded.is_empty() {
            return None;
        }
        percent_decode_str(&encoded.replace('+', " "))
            .decode_utf8()
            .ok()
            .map(|s| s.into_owned())
    })
}

fn script_response(
    source: String,
    cache_control: &'static str,
    service_worker: bool,
) -> Response<Body> {
    let mut response = Response::new(Body::from(source));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/javascript"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
    headers.insert(
        "x-robots-tag",
        HeaderValue::from_static("noindex, nofollow"),
    );
    if service_worker {
        headers.insert("service-worker-allowed", HeaderValue::from_static("/"));
    }
    response
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        "x-robots-tag",
        HeaderValue::from_static("noindex, nofollow"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config() -> Config {
        Config::from_vars(
            [("ROOT_DOMAIN".to_string(), "p.example".to_string())].into_iter(),
        )
        .unwrap()
    }

    #[test]
    fn interceptor_embeds_root_domain() {
        let source = interceptor_source("p.example");
        assert!(source.contains("'p.example'"));
        assert!(!source.contains("__ROOT_DOMAIN__"));
    }

    #[test]
    fn interceptor_endpoint_is_cacheable_javascript() {
        let response = handle(INTERCEPTOR_PATH, None, &config()).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/javascript"
        );
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "public, max-age=43200"
        );
        assert_eq!(
            response.headers().get("x-robots-tag").unwrap(),
            "noindex, nofollow"
        );
    }

    #[test]
    fn service_worker_endpoint_sets_scope_header() {
        let response = handle(SERVICE_WORKER_PATH, None, &config()).unwrap();
        assert_eq!(
            response.headers().get("service-worker-allowed").unwrap(),
            "/"
        );
    }

    #[test]
    fn injector_requires_target() {
        let response = handle(SW_INJECTOR_PATH, None, &config()).unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = handle(SW_INJECTOR_PATH, Some("other=1"), &config()).unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = handle(
            SW_INJECTOR_PATH,
            Some("target=https%3A%2F%2Fexample.com%2Fsw.js"),
            &config(),
        )
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("service-worker-allowed").unwrap(),
            "/"
        );
    }

    #[test]
    fn unknown_paths_are_not_assets() {
        assert!(handle("/index.html", None, &config()).is_none());
        assert!(handle("/", None, &config()).is_none());
    }
}
