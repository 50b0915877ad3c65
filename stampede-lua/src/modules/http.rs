use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mlua::{Lua, Table, Value};

use stampede_core::http::{HttpRequest, HttpResponse};
use stampede_core::{HttpClient, Sample, SampleSink, builtin};
use stampede_metrics::MetricKind;

use super::RegisterContext;
use crate::Result;

struct RequestOpts {
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
}

fn parse_opts(opts: Option<Table>) -> mlua::Result<RequestOpts> {
    let mut out = RequestOpts {
        headers: Vec::new(),
        timeout: None,
    };
    let Some(opts) = opts else {
        return Ok(out);
    };

    if let Ok(Value::Table(headers)) = opts.get::<Value>("headers") {
        for pair in headers.pairs::<String, String>() {
            let (k, v) = pair?;
            out.headers.push((k, v));
        }
    }

    match opts.get::<Value>("timeout") {
        Ok(Value::Integer(i)) if i > 0 => out.timeout = Some(Duration::from_secs(i as u64)),
        Ok(Value::Number(n)) if n > 0.0 => out.timeout = Some(Duration::from_secs_f64(n)),
        Ok(Value::String(s)) => {
            let s = s.to_string_lossy();
            out.timeout = humantime::parse_duration(&s)
                .map(Some)
                .map_err(mlua::Error::external)?;
        }
        _ => {}
    }

    Ok(out)
}

fn emit_request_samples(
    sink: &SampleSink,
    group: Option<&str>,
    method: &str,
    status: Option<u16>,
    elapsed: Duration,
    bytes_sent: u64,
    bytes_received: u64,
    failed: bool,
) {
    let with_tags = |mut sample: Sample| {
        sample = sample.with_tag("method", method);
        if let Some(status) = status {
            sample = sample.with_tag("status", &status.to_string());
        }
        if let Some(group) = group {
            sample = sample.with_tag("group", group);
        }
        sample
    };

    sink.emit(with_tags(Sample::now(
        builtin::HTTP_REQS,
        MetricKind::Counter,
        1.0,
    )));
    sink.emit(with_tags(Sample::now(
        builtin::HTTP_REQ_DURATION,
        MetricKind::Trend,
        elapsed.as_secs_f64() * 1_000.0,
    )));
    sink.emit(with_tags(Sample::now(
        builtin::HTTP_REQ_FAILED,
        MetricKind::Rate,
        if failed { 1.0 } else { 0.0 },
    )));
    if bytes_sent > 0 {
        sink.emit(Sample::now(
            builtin::DATA_SENT,
            MetricKind::Counter,
            bytes_sent as f64,
        ));
    }
    if bytes_received > 0 {
        sink.emit(Sample::now(
            builtin::DATA_RECEIVED,
            MetricKind::Counter,
            bytes_received as f64,
        ));
    }
}

fn response_table(lua: &Lua, response: &HttpResponse) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    t.set("status", response.status)?;
    t.set("body", lua.create_string(&response.body)?)?;
    let headers = lua.create_table()?;
    for (k, v) in &response.headers {
        headers.set(k.as_str(), v.as_str())?;
    }
    t.set("headers", headers)?;
    Ok(t)
}

fn error_table(lua: &Lua, message: &str) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    t.set("status", 0)?;
    t.set("body", "")?;
    t.set("error", message)?;
    Ok(t)
}

async fn perform(
    lua: Lua,
    client: Arc<HttpClient>,
    sink: SampleSink,
    method: http::Method,
    url: String,
    body: Bytes,
    opts: Option<Table>,
) -> mlua::Result<Table> {
    let opts = parse_opts(opts)?;
    let group = super::group_tag(&lua);

    let request = HttpRequest {
        method: method.clone(),
        url,
        headers: opts.headers,
        body,
        timeout: opts.timeout,
    };

    let started = Instant::now();
    let result = client.request(request).await;
    let elapsed = started.elapsed();

    match result {
        Ok(response) => {
            emit_request_samples(
                &sink,
                group.as_deref(),
                method.as_str(),
                Some(response.status),
                elapsed,
                response.bytes_sent,
                response.bytes_received,
                response.is_failure(),
            );
            response_table(&lua, &response)
        }
        Err(err) => {
            emit_request_samples(
                &sink,
                group.as_deref(),
                method.as_str(),
                None,
                elapsed,
                0,
                0,
                true,
            );
            error_table(&lua, &err.to_string())
        }
    }
}

pub(super) fn register(lua: &Lua, ctx: &RegisterContext) -> Result<()> {
    let client = ctx.client.clone();
    let sink = ctx.sink.clone();

    let loader = lua.create_function(move |lua, ()| {
        let t = lua.create_table()?;

        let get = {
            let client = client.clone();
            let sink = sink.clone();
            lua.create_async_function(move |lua, (url, opts): (String, Option<Table>)| {
                perform(
                    lua,
                    client.clone(),
                    sink.clone(),
                    http::Method::GET,
                    url,
                    Bytes::new(),
                    opts,
                )
            })?
        };
        t.set("get", get)?;

        let post = {
            let client = client.clone();
            let sink = sink.clone();
            lua.create_async_function(
                move |lua, (url, body, opts): (String, Option<mlua::String>, Option<Table>)| {
                    let body = body
                        .map(|b| Bytes::copy_from_slice(&b.as_bytes()))
                        .unwrap_or_default();
                    perform(
                        lua,
                        client.clone(),
                        sink.clone(),
                        http::Method::POST,
                        url,
                        body,
                        opts,
                    )
                },
            )?
        };
        t.set("post", post)?;

        let request = {
            let client = client.clone();
            let sink = sink.clone();
            lua.create_async_function(
                move |lua,
                      (method, url, body, opts): (
                    String,
                    String,
                    Option<mlua::String>,
                    Option<Table>,
                )| {
                    let parsed = method.parse::<http::Method>();
                    let client = client.clone();
                    let sink = sink.clone();
                    async move {
                        let method = parsed.map_err(mlua::Error::external)?;
                        let body = body
                            .map(|b| Bytes::copy_from_slice(&b.as_bytes()))
                            .unwrap_or_default();
                        perform(lua, client, sink, method, url, body, opts).await
                    }
                },
            )?
        };
        t.set("request", request)?;

        Ok(t)
    })?;

    super::preload_set(lua, "stampede/http", loader)
}
