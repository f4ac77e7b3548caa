//! Preamble generation: defines the in-sandbox callback primitives that let
//! the untrusted snippet reach back into the broker plane over loopback
//! HTTP. Bearer tokens and ports are interpolated as string constants —
//! the child never receives them any other way.

use crate::sandbox::supervisor::Language;

pub struct BrokerEndpoints {
    pub tool_call_port: u16,
    pub tool_call_token: String,
    pub discovery_port: u16,
    pub discovery_token: String,
    pub sampling: Option<(u16, String)>,
}

pub fn build(language: Language, endpoints: &BrokerEndpoints) -> String {
    match language {
        Language::TypeScript => typescript_preamble(endpoints),
        Language::Python => python_preamble(endpoints),
    }
}

fn typescript_preamble(e: &BrokerEndpoints) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "const __PTC_TOOL_CALL_URL = \"http://127.0.0.1:{}/\";\n",
        e.tool_call_port
    ));
    out.push_str(&format!("const __PTC_TOOL_CALL_TOKEN = \"{}\";\n", e.tool_call_token));
    out.push_str(&format!(
        "const __PTC_DISCOVERY_URL = \"http://127.0.0.1:{}/tools\";\n",
        e.discovery_port
    ));
    out.push_str(&format!("const __PTC_DISCOVERY_TOKEN = \"{}\";\n", e.discovery_token));
    out.push_str(
        "async function callTool(toolName, params) {\n\
         \x20\x20const res = await fetch(__PTC_TOOL_CALL_URL, {\n\
         \x20\x20\x20\x20method: \"POST\",\n\
         \x20\x20\x20\x20headers: {\"Authorization\": `Bearer ${__PTC_TOOL_CALL_TOKEN}`, \"Content-Type\": \"application/json\"},\n\
         \x20\x20\x20\x20body: JSON.stringify({toolName, params}),\n\
         \x20\x20});\n\
         \x20\x20const body = await res.json();\n\
         \x20\x20if (!res.ok) { throw new Error(JSON.stringify(body.error ?? body)); }\n\
         \x20\x20return body.result;\n\
         }\n\n\
         async function discoverTools(query) {\n\
         \x20\x20const q = (query ?? []).map(t => `q=${encodeURIComponent(t)}`).join(\"&\");\n\
         \x20\x20const res = await fetch(`${__PTC_DISCOVERY_URL}?${q}`, {\n\
         \x20\x20\x20\x20headers: {\"Authorization\": `Bearer ${__PTC_DISCOVERY_TOKEN}`},\n\
         \x20\x20});\n\
         \x20\x20return (await res.json()).tools;\n\
         }\n\n",
    );
    if let Some((port, token)) = &e.sampling {
        out.push_str(&format!("const __PTC_SAMPLE_URL = \"http://127.0.0.1:{port}/sample\";\n"));
        out.push_str(&format!("const __PTC_SAMPLE_TOKEN = \"{token}\";\n"));
        out.push_str(
            "async function ask(messages, opts) {\n\
             \x20\x20const res = await fetch(__PTC_SAMPLE_URL, {\n\
             \x20\x20\x20\x20method: \"POST\",\n\
             \x20\x20\x20\x20headers: {\"Authorization\": `Bearer ${__PTC_SAMPLE_TOKEN}`, \"Content-Type\": \"application/json\"},\n\
             \x20\x20\x20\x20body: JSON.stringify({messages, ...opts}),\n\
             \x20\x20});\n\
             \x20\x20const body = await res.json();\n\
             \x20\x20if (!res.ok) { throw new Error(JSON.stringify(body.error ?? body)); }\n\
             \x20\x20return body.content?.[0]?.text ?? \"\";\n\
             }\n\n",
        );
    }
    out
}

fn python_preamble(e: &BrokerEndpoints) -> String {
    let mut out = String::new();
    out.push_str("import json, urllib.request\n\n");
    out.push_str(&format!("__PTC_TOOL_CALL_URL = \"http://127.0.0.1:{}/\"\n", e.tool_call_port));
    out.push_str(&format!("__PTC_TOOL_CALL_TOKEN = \"{}\"\n", e.tool_call_token));
    out.push_str(&format!(
        "__PTC_DISCOVERY_URL = \"http://127.0.0.1:{}/tools\"\n",
        e.discovery_port
    ));
    out.push_str(&format!("__PTC_DISCOVERY_TOKEN = \"{}\"\n\n", e.discovery_token));
    out.push_str(
        "def call_tool(tool_name, params):\n\
         \x20\x20req = urllib.request.Request(\n\
         \x20\x20\x20\x20__PTC_TOOL_CALL_URL,\n\
         \x20\x20\x20\x20data=json.dumps({\"toolName\": tool_name, \"params\": params}).encode(),\n\
         \x20\x20\x20\x20headers={\"Authorization\": f\"Bearer {__PTC_TOOL_CALL_TOKEN}\", \"Content-Type\": \"application/json\"},\n\
         \x20\x20\x20\x20method=\"POST\",\n\
         \x20\x20)\n\
         \x20\x20with urllib.request.urlopen(req) as resp:\n\
         \x20\x20\x20\x20return json.load(resp)[\"result\"]\n\n\
         def discover_tools(query=None):\n\
         \x20\x20import urllib.parse\n\
         \x20\x20q = \"&\".join(f\"q={urllib.parse.quote(t)}\" for t in (query or []))\n\
         \x20\x20req = urllib.request.Request(\n\
         \x20\x20\x20\x20f\"{__PTC_DISCOVERY_URL}?{q}\",\n\
         \x20\x20\x20\x20headers={\"Authorization\": f\"Bearer {__PTC_DISCOVERY_TOKEN}\"},\n\
         \x20\x20)\n\
         \x20\x20with urllib.request.urlopen(req) as resp:\n\
         \x20\x20\x20\x20return json.load(resp)[\"tools\"]\n\n",
    );
    if let Some((port, token)) = &e.sampling {
        out.push_str(&format!("__PTC_SAMPLE_URL = \"http://127.0.0.1:{port}/sample\"\n"));
        out.push_str(&format!("__PTC_SAMPLE_TOKEN = \"{token}\"\n\n"));
        out.push_str(
            "def ask(messages, **opts):\n\
             \x20\x20payload = {\"messages\": messages, **opts}\n\
             \x20\x20req = urllib.request.Request(\n\
             \x20\x20\x20\x20__PTC_SAMPLE_URL,\n\
             \x20\x20\x20\x20data=json.dumps(payload).encode(),\n\
             \x20\x20\x20\x20headers={\"Authorization\": f\"Bearer {__PTC_SAMPLE_TOKEN}\", \"Content-Type\": \"application/json\"},\n\
             \x20\x20\x20\x20method=\"POST\",\n\
             \x20\x20)\n\
             \x20\x20with urllib.request.urlopen(req) as resp:\n\
             \x20\x20\x20\x20body = json.load(resp)\n\
             \x20\x20\x20\x20content = body.get(\"content\") or []\n\
             \x20\x20\x20\x20return content[0][\"text\"] if content else \"\"\n\n",
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> BrokerEndpoints {
        BrokerEndpoints {
            tool_call_port: 5001,
            tool_call_token: "tc-tok".into(),
            discovery_port: 5002,
            discovery_token: "disc-tok".into(),
            sampling: Some((5003, "sample-tok".into())),
        }
    }

    #[test]
    fn typescript_preamble_embeds_tokens_and_ports() {
        let script = build(Language::TypeScript, &endpoints());
        assert!(script.contains("5001"));
        assert!(script.contains("tc-tok"));
        assert!(script.contains("async function callTool"));
        assert!(script.contains("async function ask"));
    }

    #[test]
    fn python_preamble_embeds_tokens_and_ports() {
        let script = build(Language::Python, &endpoints());
        assert!(script.contains("5002"));
        assert!(script.contains("disc-tok"));
        assert!(script.contains("def call_tool"));
        assert!(script.contains("def ask"));
    }

    #[test]
    fn sampling_disabled_omits_ask_primitive() {
        let mut e = endpoints();
        e.sampling = None;
        let script = build(Language::TypeScript, &e);
        assert!(!script.contains("async function ask"));
    }
}
