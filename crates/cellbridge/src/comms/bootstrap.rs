//! Front-end bootstrap script.
//!
//! Published as a transient HTML `<script>` so it is never saved with the
//! notebook. It opens a comm with the kernel, answers heartbeat pings and
//! keeps the comm alive until the page unloads.

use crate::comms::{HEARTBEAT_PING_ADDRESS, HEARTBEAT_PONG_ADDRESS};

/// Builds the default bootstrap script for `target_name`.
pub fn default_script(target_name: &str) -> String {
    format!(
        r#"(function() {{
  const kernel = (window.Jupyter && Jupyter.notebook && Jupyter.notebook.kernel) || window.__cellbridgeKernel;
  if (!kernel || !kernel.comm_manager) {{
    console.warn("cellbridge: no kernel comm manager available");
    return;
  }}
  const comm = kernel.comm_manager.new_comm("{target}", {{}});
  comm.on_msg(function(msg) {{
    const data = msg.content.data || {{}};
    if (data.address === "{ping}") {{
      comm.send({{address: "{pong}", value: true}});
    }}
  }});
  window.addEventListener("beforeunload", function() {{ comm.close(); }});
}})();"#,
        target = target_name,
        ping = HEARTBEAT_PING_ADDRESS,
        pong = HEARTBEAT_PONG_ADDRESS,
    )
}

/// Wraps a script for publication as `text/html`.
pub fn as_html(script: &str) -> String {
    format!("<script>{script}</script>")
}
