//! SDP Bandwidth Shaping
//!
//! Schreibt die Video-Bandbreite empfangener Offer/Answer auf eine feste
//! Obergrenze um, bevor sie an die Peer-Connection gehen. Der Umbau ist
//! idempotent: eine vorhandene b=-Zeile im Video-Abschnitt wird ersetzt,
//! nie dupliziert.

// ============================================================================
// BANDWIDTH FORMAT
// ============================================================================

/// Welches SDP-Bandbreiten-Attribut geschrieben wird.
///
/// `Tias` trägt den Wert in bit/s, also kbps mal 1000.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthFormat {
    As,
    Tias,
}

impl BandwidthFormat {
    fn line(&self, kbps: u32) -> String {
        match self {
            BandwidthFormat::As => format!("b=AS:{}", kbps),
            BandwidthFormat::Tias => format!("b=TIAS:{}", kbps as u64 * 1000),
        }
    }
}

// ============================================================================
// MUNGE
// ============================================================================

/// Setzt die Bandbreiten-Zeile aller m=video-Abschnitte auf die Obergrenze
pub fn set_video_bandwidth(sdp: &str, kbps: u32, format: BandwidthFormat) -> String {
    let bw_line = format.line(kbps);

    let mut out: Vec<String> = Vec::new();
    let mut in_video = false;
    let mut inserted = false;

    for line in sdp.lines() {
        if line.starts_with("m=") {
            in_video = line.starts_with("m=video");
            inserted = false;
            out.push(line.to_string());
            continue;
        }

        if in_video {
            // Vorhandene b=-Zeile ersetzen statt duplizieren
            if line.starts_with("b=AS:") || line.starts_with("b=TIAS:") {
                if !inserted {
                    out.push(bw_line.clone());
                    inserted = true;
                }
                continue;
            }

            // b= gehört direkt hinter die c=-Zeile
            if !inserted && line.starts_with("c=") {
                out.push(line.to_string());
                out.push(bw_line.clone());
                inserted = true;
                continue;
            }

            // Kein c= im Abschnitt: vor dem ersten Attribut einfügen
            if !inserted && line.starts_with("a=") {
                out.push(bw_line.clone());
                inserted = true;
            }
        }

        out.push(line.to_string());
    }

    let mut result = out.join("\r\n");
    result.push_str("\r\n");
    result
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\na=rtpmap:111 opus/48000/2\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\nc=IN IP4 0.0.0.0\r\na=rtpmap:96 VP8/90000\r\n";

    #[test]
    fn test_inserts_as_line_after_video_connection() {
        let munged = set_video_bandwidth(OFFER, 1000, BandwidthFormat::As);

        let lines: Vec<&str> = munged.lines().collect();
        let c_idx = lines
            .iter()
            .position(|l| *l == "m=video 9 UDP/TLS/RTP/SAVPF 96")
            .unwrap()
            + 1;
        assert_eq!(lines[c_idx], "c=IN IP4 0.0.0.0");
        assert_eq!(lines[c_idx + 1], "b=AS:1000");
    }

    #[test]
    fn test_tias_value_is_in_bits_per_second() {
        let munged = set_video_bandwidth(OFFER, 1000, BandwidthFormat::Tias);
        assert!(munged.contains("b=TIAS:1000000\r\n"));
        assert!(!munged.contains("b=AS:"));
    }

    #[test]
    fn test_audio_section_untouched() {
        let munged = set_video_bandwidth(OFFER, 1000, BandwidthFormat::As);

        let lines: Vec<&str> = munged.lines().collect();
        let audio_idx = lines
            .iter()
            .position(|l| l.starts_with("m=audio"))
            .unwrap();
        let video_idx = lines
            .iter()
            .position(|l| l.starts_with("m=video"))
            .unwrap();
        assert!(!lines[audio_idx..video_idx]
            .iter()
            .any(|l| l.starts_with("b=")));
    }

    #[test]
    fn test_munge_is_idempotent() {
        let once = set_video_bandwidth(OFFER, 1000, BandwidthFormat::As);
        let twice = set_video_bandwidth(&once, 1000, BandwidthFormat::As);
        assert_eq!(once, twice);
        assert_eq!(twice.matches("b=AS:1000").count(), 1);
    }

    #[test]
    fn test_replaces_existing_bandwidth_line() {
        let with_bw = set_video_bandwidth(OFFER, 500, BandwidthFormat::Tias);
        let rewritten = set_video_bandwidth(&with_bw, 1000, BandwidthFormat::As);

        assert!(!rewritten.contains("b=TIAS:"));
        assert_eq!(rewritten.matches("b=AS:1000").count(), 1);
    }
}
