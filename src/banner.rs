//! Banner extraction: finds protocol-identifying strings in the first payload of each flow.

use std::{
    fmt, fs,
    net::IpAddr,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use aho_corasick::AhoCorasick;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    record::{unix_nanos, FirstPayload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BannerKind {
    Client,
    Server,
    /// Either side may send the banner (SSH); decided by which port matches the term's port.
    ClientServer,
}

/// A search term, e.g.
/// `{"type": "client", "port": 80, "iana_tag": "www-http", "skip_term": true, "term": "\nUser-Agent: "}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannerTerm {
    #[serde(rename = "type")]
    pub kind: BannerKind,
    pub port: u16,
    pub iana_tag: String,
    #[serde(default)]
    pub skip_term: bool,
    pub term: String,
    #[serde(default)]
    pub proxy_term: String,
    #[serde(default)]
    pub delimiters: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Banner {
    pub ip: IpAddr,
    #[serde(serialize_with = "unix_nanos")]
    pub seen: SystemTime,
    pub port: u16,
    pub iana_tag: String,
    #[serde(rename = "type")]
    pub kind: BannerKind,
    pub flow_id: u64,
    pub banner: String,
}

impl fmt::Display for Banner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seen = self.seen.duration_since(UNIX_EPOCH).unwrap_or_default();
        let kind = match self.kind {
            BannerKind::Client => "client",
            BannerKind::Server => "server",
            BannerKind::ClientServer => "clientserver",
        };
        write!(
            f,
            "{}.{:06}, ip: {}, flow_id: {}, tag: {}/{}, type: {}, banner: {}",
            seen.as_secs(),
            seen.subsec_micros(),
            self.ip,
            self.flow_id,
            self.iana_tag,
            self.port,
            kind,
            self.banner
        )
    }
}

/// Cuts a banner out of `payload`: start at `proxy` (or `term` when there is no proxy) if it
/// occurs, drop that prefix when `skip` is set, then stop at the first delimiter character.
pub fn extract_banner(payload: &str, term: &str, proxy: &str, skip: bool, delimiters: &str) -> String {
    let anchor = if proxy.is_empty() { term } else { proxy };
    let mut banner = payload;

    if let Some(index) = banner.find(anchor) {
        banner = &banner[index..];
        if skip {
            banner = &banner[anchor.len()..];
        }
    }
    if let Some(index) = banner.find(|c: char| delimiters.contains(c)) {
        banner = &banner[..index];
    }
    banner.to_string()
}

pub struct BannerMatcher {
    terms: Vec<BannerTerm>,
    automaton: AhoCorasick,
}

impl BannerMatcher {
    pub fn new(terms: Vec<BannerTerm>) -> Result<Self> {
        let automaton = AhoCorasick::new(terms.iter().map(|t| t.term.as_str()))?;
        Ok(Self { terms, automaton })
    }

    /// Loads a JSON array of [`BannerTerm`]s.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read(path)?;
        let terms: Vec<BannerTerm> = serde_json::from_slice(&raw)?;
        debug!("loaded {} banner terms", terms.len());
        Self::new(terms)
    }

    #[inline]
    pub fn terms(&self) -> &[BannerTerm] {
        &self.terms
    }

    /// Every banner found in a flow's first payload. Each distinct term that occurs contributes
    /// in order of first occurrence.
    pub fn extract(&self, fp: &FirstPayload) -> Vec<Banner> {
        let mut hits: Vec<usize> = Vec::new();
        for m in self.automaton.find_overlapping_iter(fp.payload.as_slice()) {
            let index = m.pattern().as_usize();
            if !hits.contains(&index) {
                hits.push(index);
            }
        }
        if hits.is_empty() {
            return Vec::new();
        }

        let text = String::from_utf8_lossy(&fp.payload);
        let mut banners = Vec::with_capacity(hits.len());
        for index in hits {
            let term = &self.terms[index];
            let text_of = |term: &BannerTerm| {
                extract_banner(&text, &term.term, &term.proxy_term, term.skip_term, &term.delimiters)
            };
            let banner = |kind: BannerKind, port: u16| Banner {
                ip: fp.ip,
                seen: fp.seen,
                port,
                iana_tag: term.iana_tag.clone(),
                kind,
                flow_id: fp.flow_id,
                banner: text_of(term),
            };
            match term.kind {
                BannerKind::Client => banners.push(banner(BannerKind::Client, term.port)),
                // the real port, not the canonical one
                BannerKind::Server => banners.push(banner(BannerKind::Server, fp.sport)),
                BannerKind::ClientServer => {
                    if fp.sport == term.port {
                        banners.push(banner(BannerKind::Server, fp.sport));
                    }
                    if fp.dport == term.port {
                        banners.push(banner(BannerKind::Client, term.port));
                    }
                }
            }
        }
        banners
    }
}
