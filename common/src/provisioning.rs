use serde::{Deserialize, Serialize};

use crate::config::{StoredConfig, DEFAULT_ORG, DEFAULT_REPORT_INTERVAL_MS};

/// Paths operating systems probe to detect a captive portal. All of them serve the setup page.
pub const CAPTIVE_PROBE_PATHS: [&str; 7] = [
    "/",
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

pub const MAX_PROVISIONING_BODY: usize = 4096;

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningRequest {
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPassword", default)]
    pub wifi_password: Option<String>,
    #[serde(rename = "databaseUrl")]
    pub database_url: String,
    #[serde(rename = "databaseToken", default)]
    pub database_token: Option<String>,
    #[serde(rename = "databaseBucket")]
    pub database_bucket: String,
    #[serde(rename = "databaseOrg", default)]
    pub database_org: Option<String>,
    #[serde(rename = "reportIntervalMs", default)]
    pub report_interval_ms: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningView {
    provisioned: bool,
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPasswordSet")]
    wifi_password_set: bool,
    #[serde(rename = "databaseUrl")]
    database_url: String,
    #[serde(rename = "databaseTokenSet")]
    database_token_set: bool,
    #[serde(rename = "databaseBucket")]
    database_bucket: String,
    #[serde(rename = "databaseOrg")]
    database_org: String,
    #[serde(rename = "reportIntervalMs")]
    report_interval_ms: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningResponse {
    pub saved: bool,
    #[serde(rename = "restartRequired")]
    pub restart_required: bool,
    pub config: ProvisioningView,
}

impl ProvisioningRequest {
    pub fn validate(&self, current: &StoredConfig) -> Result<(), &'static str> {
        if self.wifi_ssid.trim().is_empty() {
            return Err("wifiSsid cannot be empty");
        }

        let url = self.database_url.trim();
        if url.is_empty() {
            return Err("databaseUrl cannot be empty");
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err("databaseUrl must start with http:// or https://");
        }

        if self.database_bucket.trim().is_empty() {
            return Err("databaseBucket cannot be empty");
        }

        let token_supplied = self
            .database_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty());
        if !token_supplied && current.meta.database_token.trim().is_empty() {
            return Err("databaseToken cannot be empty");
        }

        if let Some(interval) = self
            .report_interval_ms
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            match interval.parse::<u64>() {
                Ok(value) if value > 0 => {}
                _ => return Err("reportIntervalMs must be a positive number of milliseconds"),
            }
        }

        Ok(())
    }

    /// Merges the submission into `stored` and marks it provisioned. Blank
    /// secrets keep the stored value.
    pub fn apply_to(self, stored: &mut StoredConfig) {
        stored.ssid = self.wifi_ssid.trim().to_string();
        if let Some(password) = self.wifi_password.filter(|value| !value.is_empty()) {
            stored.wifi_password = password;
        }

        stored.meta.database_url = self.database_url.trim().to_string();
        if let Some(token) = self
            .database_token
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            stored.meta.database_token = token;
        }
        stored.meta.database_bucket = self.database_bucket.trim().to_string();
        stored.meta.database_org = self
            .database_org
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        stored.meta.report_interval_ms = self
            .report_interval_ms
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        stored.mark_provisioned();
    }
}

impl ProvisioningView {
    pub fn from_stored(stored: &StoredConfig) -> Self {
        Self {
            provisioned: stored.is_provisioned(),
            wifi_ssid: stored.ssid.clone(),
            wifi_password_set: !stored.wifi_password.is_empty(),
            database_url: stored.meta.database_url.clone(),
            database_token_set: !stored.meta.database_token.is_empty(),
            database_bucket: stored.meta.database_bucket.clone(),
            database_org: stored
                .meta
                .database_org
                .clone()
                .unwrap_or_else(|| DEFAULT_ORG.to_string()),
            report_interval_ms: stored
                .meta
                .report_interval_ms
                .clone()
                .unwrap_or_else(|| DEFAULT_REPORT_INTERVAL_MS.to_string()),
        }
    }
}

pub const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Climate Logger Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:640px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>Climate Logger Setup</h1>
  <p class="muted">Connect the logger to WiFi and point it at an InfluxDB v2 bucket.</p>

  <div class="card">
    <h2>WiFi</h2>
    <label>SSID</label><input id="wifiSsid" type="text">
    <label>Password (leave blank to keep current)</label><input id="wifiPassword" type="password">
  </div>

  <div class="card">
    <h2>InfluxDB</h2>
    <label>InfluxDB Address</label><input id="databaseUrl" type="text" placeholder="http://192.168.1.10:8086">
    <label>InfluxDB Token (leave blank to keep current)</label><input id="databaseToken" type="password">
    <label>InfluxDB Bucket</label><input id="databaseBucket" type="text">
    <label>InfluxDB Org</label><input id="databaseOrg" type="text" placeholder="iotlab">
    <label>Report Interval (ms)</label><input id="reportIntervalMs" type="number" min="1" placeholder="10000">
    <button id="save">Save and Restart</button>
  </div>

  <p id="status" class="muted"></p>

  <script>
    const q=(id)=>document.getElementById(id);

    async function api(path,opt){
      const r=await fetch(path,opt);let b={};
      try{b=await r.json();}catch(_){}
      if(!r.ok)throw new Error(b.error||('Request failed: '+r.status));
      return b;
    }

    async function load(){
      const c=await api('/api/config');
      q('wifiSsid').value=c.wifiSsid||'';
      q('databaseUrl').value=c.databaseUrl||'';
      q('databaseBucket').value=c.databaseBucket||'';
      q('databaseOrg').value=c.databaseOrg||'';
      q('reportIntervalMs').value=c.reportIntervalMs||'';
    }

    q('save').addEventListener('click', async ()=>{
      q('status').className='muted'; q('status').textContent='Saving...';
      try{
        const payload={
          wifiSsid:q('wifiSsid').value.trim(),
          wifiPassword:q('wifiPassword').value||undefined,
          databaseUrl:q('databaseUrl').value.trim(),
          databaseToken:q('databaseToken').value||undefined,
          databaseBucket:q('databaseBucket').value.trim(),
          databaseOrg:q('databaseOrg').value.trim()||undefined,
          reportIntervalMs:q('reportIntervalMs').value.trim()||undefined,
        };
        const res=await api('/api/config',{method:'PUT',headers:{'content-type':'application/json'},body:JSON.stringify(payload)});
        q('status').className='ok'; q('status').textContent=res.restartRequired?'Saved. Restarting...':'Saved.';
        q('wifiPassword').value=''; q('databaseToken').value='';
      }catch(err){q('status').className='err'; q('status').textContent=err.message;}
    });

    load().catch((err)=>{q('status').className='err';q('status').textContent=err.message;});
  </script>
</body>
</html>
"#;
