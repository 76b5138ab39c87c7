//! SDP-Umschreibung für Codec-Präferenz und Bitraten-Deckel
//!
//! webrtc-rs bietet keine stabile strukturierte Codec-Präferenz-API,
//! daher wird die Reihenfolge der Payload-Typen in der m=-Zeile
//! textuell umgestellt. Die Funktionen hier sind bewusst schmal
//! gehalten und werden gegen SDP-Fixtures getestet.

/// Trennt SDP in Zeilen (ohne Zeilenenden) und merkt sich ob CRLF genutzt wurde.
fn split_lines(sdp: &str) -> (Vec<String>, bool) {
    let crlf = sdp.contains("\r\n");
    let lines = sdp
        .lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect();
    (lines, crlf)
}

fn join_lines(lines: Vec<String>, crlf: bool) -> String {
    let sep = if crlf { "\r\n" } else { "\n" };
    let mut out = lines.join(sep);
    out.push_str(sep);
    out
}

/// Grenzen der Media-Section `m=<media>` finden: (Index der m=-Zeile, Ende exklusiv).
fn media_section(lines: &[String], media: &str) -> Option<(usize, usize)> {
    let prefix = format!("m={} ", media);
    let start = lines.iter().position(|l| l.starts_with(&prefix))?;
    let end = lines[start + 1..]
        .iter()
        .position(|l| l.starts_with("m="))
        .map(|off| start + 1 + off)
        .unwrap_or(lines.len());
    Some((start, end))
}

/// Stellt die Payload-Typen der angegebenen Media-Section so um, dass die
/// bevorzugten Codecs (in Reihenfolge) vorne stehen. Zugehörige RTX-Payloads
/// (`a=fmtp:<pt> apt=<basis>`) wandern direkt hinter ihren Basis-Codec.
///
/// Unbekannte Codecs sind ein No-op; die Funktion ist idempotent.
pub fn prefer_codecs(sdp: &str, media: &str, preferred: &[&str]) -> String {
    let (mut lines, crlf) = split_lines(sdp);

    let Some((m_idx, end)) = media_section(&lines, media) else {
        return sdp.to_string();
    };

    // rtpmap: Payload-Typ -> Codec-Name
    let mut rtpmap: Vec<(String, String)> = Vec::new();
    // rtx: Payload-Typ -> Basis-Payload-Typ
    let mut rtx_apt: Vec<(String, String)> = Vec::new();

    for line in &lines[m_idx + 1..end] {
        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            // Format: "<pt> <codec>/<clock>[/<ch>]"
            if let Some((pt, codec_part)) = rest.split_once(' ') {
                let codec = codec_part.split('/').next().unwrap_or("");
                rtpmap.push((pt.to_string(), codec.to_string()));
            }
        } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
            if let Some((pt, params)) = rest.split_once(' ') {
                if let Some(apt) = params
                    .split(';')
                    .find_map(|p| p.trim().strip_prefix("apt="))
                {
                    rtx_apt.push((pt.to_string(), apt.to_string()));
                }
            }
        }
    }

    let m_fields: Vec<String> = lines[m_idx].split(' ').map(str::to_string).collect();
    if m_fields.len() <= 3 {
        return sdp.to_string();
    }
    let (header, payloads) = m_fields.split_at(3);
    let payloads: Vec<String> = payloads.to_vec();

    let mut ordered: Vec<String> = Vec::with_capacity(payloads.len());
    for want in preferred {
        for (pt, codec) in &rtpmap {
            if codec.eq_ignore_ascii_case(want) && payloads.contains(pt) && !ordered.contains(pt) {
                ordered.push(pt.clone());
                // RTX direkt dahinter
                for (rtx_pt, apt) in &rtx_apt {
                    if apt == pt && payloads.contains(rtx_pt) && !ordered.contains(rtx_pt) {
                        ordered.push(rtx_pt.clone());
                    }
                }
            }
        }
    }

    if ordered.is_empty() {
        // Keiner der Wunsch-Codecs angeboten
        return sdp.to_string();
    }

    for pt in &payloads {
        if !ordered.contains(pt) {
            ordered.push(pt.clone());
        }
    }

    let mut new_m = header.to_vec();
    new_m.extend(ordered);
    lines[m_idx] = new_m.join(" ");

    join_lines(lines, crlf)
}

/// Setzt ein `b=AS:`-Bandbreiten-Limit in der Video-Section.
///
/// Ein bereits vorhandenes Limit wird ersetzt. Das konservative Limit ist
/// Absicht: Verbindungsstabilität geht vor Bildqualität.
pub fn cap_video_bandwidth(sdp: &str, kbps: u32) -> String {
    let (mut lines, crlf) = split_lines(sdp);

    let Some((m_idx, end)) = media_section(&lines, "video") else {
        return sdp.to_string();
    };

    let bw_line = format!("b=AS:{}", kbps);

    if let Some(off) = lines[m_idx + 1..end]
        .iter()
        .position(|l| l.starts_with("b=AS:"))
    {
        lines[m_idx + 1 + off] = bw_line;
        return join_lines(lines, crlf);
    }

    // b= gehört laut RFC 4566 hinter c=, sonst direkt hinter die m=-Zeile
    let insert_at = lines[m_idx + 1..end]
        .iter()
        .position(|l| l.starts_with("c="))
        .map(|off| m_idx + 1 + off + 1)
        .unwrap_or(m_idx + 1);

    lines.insert(insert_at, bw_line);
    join_lines(lines, crlf)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const VIDEO_SDP: &str = "v=0\r\n\
        o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111 103\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=rtpmap:103 ISAC/16000\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96 97 102 103\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=rtpmap:96 VP8/90000\r\n\
        a=rtpmap:97 rtx/90000\r\n\
        a=fmtp:97 apt=96\r\n\
        a=rtpmap:102 H264/90000\r\n\
        a=rtpmap:103 rtx/90000\r\n\
        a=fmtp:103 apt=102\r\n";

    #[test]
    fn test_h264_moved_to_front() {
        let out = prefer_codecs(VIDEO_SDP, "video", &["H264", "VP8"]);
        let m_line = out
            .lines()
            .find(|l| l.starts_with("m=video"))
            .unwrap();
        // H264 (102) samt RTX (103) vor VP8 (96/97)
        assert_eq!(m_line, "m=video 9 UDP/TLS/RTP/SAVPF 102 103 96 97");
    }

    #[test]
    fn test_prefer_is_idempotent() {
        let once = prefer_codecs(VIDEO_SDP, "video", &["H264", "VP8"]);
        let twice = prefer_codecs(&once, "video", &["H264", "VP8"]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unknown_codec_is_noop() {
        let out = prefer_codecs(VIDEO_SDP, "video", &["AV1"]);
        assert_eq!(out, VIDEO_SDP);
    }

    #[test]
    fn test_audio_section_untouched_by_video_preference() {
        let out = prefer_codecs(VIDEO_SDP, "video", &["H264"]);
        let m_audio = out.lines().find(|l| l.starts_with("m=audio")).unwrap();
        assert_eq!(m_audio, "m=audio 9 UDP/TLS/RTP/SAVPF 111 103");
    }

    #[test]
    fn test_opus_preferred_in_audio() {
        let swapped = VIDEO_SDP.replace(
            "m=audio 9 UDP/TLS/RTP/SAVPF 111 103",
            "m=audio 9 UDP/TLS/RTP/SAVPF 103 111",
        );
        let out = prefer_codecs(&swapped, "audio", &["opus"]);
        let m_audio = out.lines().find(|l| l.starts_with("m=audio")).unwrap();
        assert_eq!(m_audio, "m=audio 9 UDP/TLS/RTP/SAVPF 111 103");
    }

    #[test]
    fn test_bandwidth_cap_inserted_after_c_line() {
        let out = cap_video_bandwidth(VIDEO_SDP, 800);
        let lines: Vec<&str> = out.lines().collect();
        let c_idx = lines.iter().position(|l| *l == "c=IN IP4 0.0.0.0").unwrap();
        // erste c=-Zeile gehört zur Audio-Section, dort darf kein b=AS stehen
        assert_ne!(lines[c_idx + 1], "b=AS:800");
        let m_video = lines.iter().position(|l| l.starts_with("m=video")).unwrap();
        assert_eq!(lines[m_video + 2], "b=AS:800");
        // nur einmal eingefügt
        assert_eq!(out.matches("b=AS:").count(), 1);
    }

    #[test]
    fn test_bandwidth_cap_replaces_existing() {
        let once = cap_video_bandwidth(VIDEO_SDP, 1200);
        let twice = cap_video_bandwidth(&once, 800);
        assert_eq!(twice.matches("b=AS:").count(), 1);
        assert!(twice.contains("b=AS:800"));
        assert!(!twice.contains("b=AS:1200"));
    }

    #[test]
    fn test_sdp_without_video_section_is_noop() {
        let audio_only = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n";
        assert_eq!(cap_video_bandwidth(audio_only, 800), audio_only);
    }
}
