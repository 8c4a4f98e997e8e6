//! Guest-side glue injected before challenge code.
//!
//! The prelude captures `Deno.core.ops` in a closure, installs the `console`,
//! `expect`, `test` and `express` globals, then deletes `Deno` and `eval` and
//! neuters the Function constructors. Assertion predicates and the mock route
//! table live in Rust; the JavaScript here only snapshots values, keeps
//! handler functions and forwards calls to ops.

use crate::assert::Matcher;

/// Objects nested deeper than this are snapshotted as references.
pub const SNAPSHOT_MAX_DEPTH: usize = 32;

const PRELUDE_TEMPLATE: &str = r#"
((ops) => {
    const MATCHERS = __MATCHERS__;
    const MAX_DEPTH = __MAX_DEPTH__;

    const format = (value) => {
        if (typeof value === 'string') return value;
        if (value instanceof Error) return `${value.name}: ${value.message}`;
        try {
            const json = JSON.stringify(value);
            return json === undefined ? String(value) : json;
        } catch (_) {
            return String(value);
        }
    };
    const line = (args) => args.map(format).join(' ') + '\n';
    const stdout = (...args) => ops.op_pairwise_stdout(line(args));
    const stderr = (...args) => ops.op_pairwise_stderr(line(args));
    globalThis.console = Object.freeze({
        log: stdout,
        info: stdout,
        debug: stdout,
        warn: stderr,
        error: stderr,
    });

    const describe = (err) => {
        if (err instanceof Error) return `${err.name}: ${err.message}`;
        return `Uncaught ${format(err)}`;
    };

    // One snapshotter per assertion so received and expected share identity ids.
    const snapshotter = () => {
        const ids = new Map();
        let next = 0;
        const idOf = (value) => {
            let id = ids.get(value);
            if (id === undefined) {
                id = next++;
                ids.set(value, id);
            }
            return id;
        };
        const snap = (value, ancestors, depth) => {
            switch (typeof value) {
                case 'undefined': return { type: 'undefined' };
                case 'boolean': return { type: 'boolean', value };
                case 'number': return { type: 'number', value: Object.is(value, -0) ? '-0' : String(value) };
                case 'bigint': return { type: 'bigint', value: value.toString() };
                case 'string': return { type: 'string', value };
                case 'symbol': return { type: 'symbol', id: idOf(value), description: value.description ?? '' };
                case 'function': return { type: 'function', id: idOf(value), name: value.name || '' };
            }
            if (value === null) return { type: 'null' };
            const id = idOf(value);
            if (ancestors.has(value) || depth >= MAX_DEPTH) return { type: 'ref', id };
            if (value instanceof Error) return { type: 'error', id, name: String(value.name), message: String(value.message) };
            if (value instanceof RegExp) return { type: 'regexp', id, source: value.source, flags: value.flags };
            if (value instanceof Date) return { type: 'date', id, value: String(value.getTime()) };
            ancestors.add(value);
            try {
                const child = (x) => snap(x, ancestors, depth + 1);
                if (Array.isArray(value)) return { type: 'array', id, items: Array.from(value, child) };
                let entries;
                if (value instanceof Map) {
                    entries = Array.from(value, ([k, x]) => [format(k), child(x)]);
                } else if (value instanceof Set) {
                    entries = Array.from(value, (x, i) => [String(i), child(x)]);
                } else {
                    entries = Object.keys(value).map((k) => [k, child(value[k])]);
                }
                const proto = Object.getPrototypeOf(value);
                const name = proto && proto.constructor ? proto.constructor.name : undefined;
                return name && name !== 'Object'
                    ? { type: 'object', id, class: name, entries }
                    : { type: 'object', id, entries };
            } finally {
                ancestors.delete(value);
            }
        };
        return (value) => snap(value, new Set(), 0);
    };

    class AssertionError extends Error {
        constructor(message) {
            super(message);
            this.name = 'AssertionError';
        }
    }

    const makeExpectation = (received, negated) => {
        const expectation = {};
        for (const name of MATCHERS) {
            expectation[name] = (...args) => {
                const snap = snapshotter();
                let subject;
                if (name === 'toThrow' && typeof received === 'function') {
                    try {
                        received();
                        subject = { type: 'thrown' };
                    } catch (err) {
                        subject = { type: 'thrown', error: snap(err) };
                    }
                } else {
                    subject = snap(received);
                }
                const expected = name === 'toHaveProperty' ? snap(args) : snap(args[0]);
                const message = ops.op_pairwise_expect(
                    name, JSON.stringify(subject), JSON.stringify(expected), negated
                );
                if (message !== '') throw new AssertionError(message);
            };
        }
        return expectation;
    };

    globalThis.expect = (received) => {
        const expectation = makeExpectation(received, false);
        expectation.not = Object.freeze(makeExpectation(received, true));
        return Object.freeze(expectation);
    };

    const pending = [];
    globalThis.test = (message, fn) => {
        const slot = ops.op_pairwise_test_begin(String(message));
        const done = (passed, error) => ops.op_pairwise_test_end(slot, passed, error);
        let result;
        try {
            result = fn();
        } catch (err) {
            done(false, describe(err));
            return;
        }
        if (result && typeof result.then === 'function') {
            pending.push(Promise.resolve(result).then(
                () => done(true, ''),
                (err) => done(false, describe(err)),
            ));
        } else {
            done(true, '');
        }
    };

    const handlers = [];
    globalThis.express = () => {
        const server = ops.op_pairwise_mock_create();
        const register = (method) => (path, handler) => {
            if (typeof handler !== 'function') {
                throw new TypeError(`handler for ${method.toUpperCase()} ${path} must be a function`);
            }
            handlers.push(handler);
            ops.op_pairwise_mock_route(server, method, String(path), handlers.length - 1);
        };
        const dispatch = (method) => (path, payload) => new Promise((resolve, reject) => {
            let index;
            try {
                index = ops.op_pairwise_mock_resolve(server, method, String(path));
            } catch (err) {
                reject(err);
                return;
            }
            Promise.resolve().then(async () => {
                const res = Object.freeze({ send: (value) => resolve(value) });
                await handlers[index]({ body: payload }, res);
            }).catch(reject);
        });
        return Object.freeze({
            get: register('get'),
            post: register('post'),
            put: register('put'),
            delete: register('delete'),
            listen: (port, callback) => {
                ops.op_pairwise_mock_listen(server, Number(port));
                if (typeof callback === 'function') callback();
            },
            getState: () => JSON.parse(ops.op_pairwise_mock_state(server)),
            request: Object.freeze({
                get: dispatch('get'),
                post: dispatch('post'),
                put: dispatch('put'),
                delete: dispatch('delete'),
            }),
        });
    };

    const settle = async () => {
        while (pending.length > 0) {
            await Promise.allSettled(pending.splice(0));
        }
    };
    Object.defineProperty(globalThis, '__pairwise', {
        value: Object.freeze({
            settle,
            describe,
            finish: (failed, error) => ops.op_pairwise_finish(failed, error),
            loopAbort: (line, column) => ops.op_pairwise_loop_abort(line, column),
        }),
        configurable: true,
        enumerable: false,
        writable: false,
    });

    delete globalThis.Deno;
    delete globalThis.eval;
    const AsyncFunction = (async function(){}).constructor;
    const GeneratorFunction = (function*(){}).constructor;
    Object.defineProperty(Function.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(AsyncFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(GeneratorFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
})(Deno.core.ops);
"#;

/// Loop abort callback used when loops report instead of throwing.
pub const LOOP_ABORT_CALLBACK: &str = "__pairwise.loopAbort";

/// Build the prelude script.
pub fn build_prelude() -> String {
    let names: Vec<&str> = Matcher::ALL.iter().map(|m| m.name()).collect();
    let matchers = serde_json::Value::from(names).to_string();
    PRELUDE_TEMPLATE
        .replace("__MATCHERS__", &matchers)
        .replace("__MAX_DEPTH__", &SNAPSHOT_MAX_DEPTH.to_string())
}

/// Wrap instrumented code and test code in the harness.
///
/// Both share one async function scope, so test code sees the learner's
/// bindings. The learner's first line stays on line 1 of the script. The
/// internals object is handed in as a parameter and removed from the global
/// object before any guest code runs.
pub fn build_harness(code: &str, test_code: &str) -> String {
    format!(
        r#"(async (__pairwise) => {{ try {{ {code}
;
{test_code}
;
    await __pairwise.settle();
    __pairwise.finish(false, "");
  }} catch (e) {{
    __pairwise.finish(true, __pairwise.describe(e));
  }}
}})((() => {{ const internals = globalThis.__pairwise; delete globalThis.__pairwise; return internals; }})());
"#
    )
}
