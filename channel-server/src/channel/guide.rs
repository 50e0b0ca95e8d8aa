// 统一低延迟视频流传输系统 - 节目单通知
//
// 每个文件开始播放时，向 tvheadend 的 xmltv 套接字写入当前节目与下一个节目。

use super::playlist::PlaylistEntry;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const XMLTV_TIME_FORMAT: &str = "%Y%m%d%H%M%S %z";
const XMLTV_PROLOG: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE tv SYSTEM \"xmltv.dtd\">\n";

#[derive(Serialize)]
#[serde(rename = "tv")]
struct XmltvDocument<'a> {
    channel: XmltvChannel<'a>,
    #[serde(rename = "programme")]
    programmes: Vec<XmltvProgramme<'a>>,
}

#[derive(Serialize)]
struct XmltvChannel<'a> {
    #[serde(rename = "@id")]
    id: &'a str,
    #[serde(rename = "display-name")]
    display_name: &'a str,
}

#[derive(Serialize)]
struct XmltvProgramme<'a> {
    #[serde(rename = "@start")]
    start: String,
    #[serde(rename = "@stop")]
    stop: String,
    #[serde(rename = "@channel")]
    channel: &'a str,
    title: XmltvTitle<'a>,
}

#[derive(Serialize)]
struct XmltvTitle<'a> {
    #[serde(rename = "@lang")]
    lang: &'static str,
    #[serde(rename = "$text")]
    text: &'a str,
}

/// 一条节目
#[derive(Debug, Clone, PartialEq)]
pub struct Programme {
    pub title: String,
    pub start: DateTime<Local>,
    pub stop: DateTime<Local>,
}

/// 节目单通知器
#[derive(Debug, Clone)]
pub struct GuideNotifier {
    socket: PathBuf,
    channel_id: String,
    display_name: String,
}

impl GuideNotifier {
    pub fn new(socket: impl Into<PathBuf>, number: u32, display_name: impl Into<String>) -> Self {
        Self {
            socket: socket.into(),
            channel_id: format!("channel{}", number),
            display_name: display_name.into(),
        }
    }

    /// 计算当前节目与下一个节目的时间
    ///
    /// 下一个节目在当前节目结束一秒后开始；时长未知的文件按零时长处理。
    pub fn schedule(
        now: DateTime<Local>,
        current: (&PlaylistEntry, Option<Duration>),
        next: (&PlaylistEntry, Option<Duration>),
    ) -> [Programme; 2] {
        let span = |duration: Option<Duration>| {
            chrono::Duration::from_std(duration.unwrap_or_default()).unwrap_or_else(|_| chrono::Duration::zero())
        };

        let stop = now + span(current.1);
        let next_start = stop + chrono::Duration::seconds(1);
        let next_stop = next_start + span(next.1);
        [
            Programme {
                title: current.0.title.clone(),
                start: now,
                stop,
            },
            Programme {
                title: next.0.title.clone(),
                start: next_start,
                stop: next_stop,
            },
        ]
    }

    /// 生成 XMLTV 文档
    pub fn render_xmltv(&self, programmes: &[Programme]) -> Result<String, String> {
        let document = XmltvDocument {
            channel: XmltvChannel {
                id: &self.channel_id,
                display_name: &self.display_name,
            },
            programmes: programmes
                .iter()
                .map(|programme| XmltvProgramme {
                    start: programme.start.format(XMLTV_TIME_FORMAT).to_string(),
                    stop: programme.stop.format(XMLTV_TIME_FORMAT).to_string(),
                    channel: &self.channel_id,
                    title: XmltvTitle {
                        lang: "en",
                        text: &programme.title,
                    },
                })
                .collect(),
        };
        let body = quick_xml::se::to_string(&document)
            .map_err(|e| format!("Failed to serialize XMLTV: {}", e))?;
        Ok(format!("{}{}\n", XMLTV_PROLOG, body))
    }

    /// 发布节目单，失败只记录日志
    pub fn publish(&self, xml: &str) {
        if !self.socket.exists() {
            debug!(
                "Guide socket {:?} does not exist, guide for {}:\n{}",
                self.socket, self.channel_id, xml
            );
            return;
        }
        match write_socket(&self.socket, xml) {
            Ok(()) => info!("Published guide for {}", self.channel_id),
            Err(e) => warn!("Failed to write guide to {:?}: {}", self.socket, e),
        }
    }
}

#[cfg(unix)]
fn write_socket(socket: &Path, xml: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    let mut stream = UnixStream::connect(socket)?;
    stream.write_all(xml.as_bytes())?;
    stream.flush()
}

#[cfg(not(unix))]
fn write_socket(socket: &Path, _xml: &str) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("unix sockets unavailable for {}", socket.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str) -> PlaylistEntry {
        PlaylistEntry::new(PathBuf::from(format!("/media/{}.mkv", title)))
    }

    #[test]
    fn test_schedule_chains_programmes() {
        let now = Local::now();
        let [current, next] = GuideNotifier::schedule(
            now,
            (&entry("first"), Some(Duration::from_secs(1800))),
            (&entry("second"), Some(Duration::from_secs(600))),
        );
        assert_eq!(current.title, "first");
        assert_eq!((current.stop - current.start).num_seconds(), 1800);
        assert_eq!((next.start - current.stop).num_seconds(), 1);
        assert_eq!((next.stop - next.start).num_seconds(), 600);

        let [unknown, _] = GuideNotifier::schedule(now, (&entry("x"), None), (&entry("y"), None));
        assert_eq!(unknown.start, unknown.stop);
    }

    #[test]
    fn test_render_xmltv() {
        let notifier = GuideNotifier::new("/nonexistent.sock", 5, "News & Weather");
        let now = Local::now();
        let programmes = GuideNotifier::schedule(
            now,
            (&entry("Tom <and> Jerry"), Some(Duration::from_secs(60))),
            (&entry("Next"), Some(Duration::from_secs(60))),
        );
        let xml = notifier.render_xmltv(&programmes).unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<channel id=\"channel5\">"));
        assert!(xml.contains("<display-name>News &amp; Weather</display-name>"));
        assert!(xml.contains("Tom &lt;and"));
        assert!(!xml.contains("<and>"));
        assert!(xml.contains("channel=\"channel5\""));
        assert!(xml.contains("<title lang=\"en\">Next</title>"));
        assert!(xml.contains(&format!("start=\"{}\"", now.format(XMLTV_TIME_FORMAT))));
        assert_eq!(xml.matches("<programme ").count(), 2);
        assert!(xml.ends_with("</tv>\n"));
    }

    #[test]
    fn test_publish_without_socket_is_silent() {
        let notifier = GuideNotifier::new("/nonexistent/xmltv.sock", 1, "One");
        notifier.publish("<tv></tv>");
    }

    #[cfg(unix)]
    #[test]
    fn test_publish_writes_socket() {
        use std::io::Read;
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xmltv.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let reader = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = String::new();
            stream.read_to_string(&mut received).unwrap();
            received
        });

        let notifier = GuideNotifier::new(&path, 2, "Two");
        notifier.publish("<tv>hello</tv>");
        assert_eq!(reader.join().unwrap(), "<tv>hello</tv>");
    }
}
