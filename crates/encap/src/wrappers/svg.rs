//! SVG container wrapper.

use super::Wrapper;
use stowage_core::{Error, Result, WrapTag};

const PRE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<!DOCTYPE svg PUBLIC "-//W3C//DTD SVG 1.0//EN" "http://www.w3.org/TR/2001/PR-SVG-20010719/DTD/svg10.dtd">
<svg width="5cm" height="2cm" viewBox="125 134 83 39" xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink">
  <g>
    <rect style="fill: #ffffff" x="126" y="135" width="80" height="36" rx="10" ry="10"/>
    <rect style="fill: none; fill-opacity:0; stroke-width: 2; stroke: #000000" x="126" y="135" width="80" height="36" rx="10" ry="10"/>
    <text font-size="12.7998" style="fill: #000000;text-anchor:middle;font-family:sans-serif;font-style:normal;font-weight:normal" x="166" y="156.9">
      <tspan x="166" y="156.9">"#;

const POST: &str = r#"</tspan>
    </text>
  </g>
</svg>"#;

/// Hex-encodes the payload into the text node of a fixed SVG document.
/// Suits backends that only accept image uploads but keep files verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct SvgWrapper;

impl Wrapper for SvgWrapper {
    fn tag(&self) -> WrapTag {
        WrapTag::new("svg")
    }

    fn wrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = String::with_capacity(PRE.len() + data.len() * 2 + POST.len());
        out.push_str(PRE);
        out.push_str(&hex::encode(data));
        out.push_str(POST);
        Ok(out.into_bytes())
    }

    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::unwrap_failed("svg envelope is not valid utf-8"))?;
        let body = text
            .strip_prefix(PRE)
            .ok_or_else(|| Error::unwrap_failed("data does not start with expected svg header"))?;
        let body = body
            .strip_suffix(POST)
            .ok_or_else(|| Error::unwrap_failed("data does not end with expected svg footer"))?;
        hex::decode(body).map_err(|_| Error::unwrap_failed("svg payload is not valid hex"))
    }
}
