//! オーバーレイ表示設定と未知値の正規化
//!
//! 列挙値は新旧どちらのバージョンが書いたデータでも読めるように
//! `Unknown` を持つ。`Unknown` は表示クライアントに渡す前と
//! 保存し直す前に必ず [`Normalize`] で既定値に置き換える。

use serde::{Deserialize, Serialize};

/// 未知の列挙値を既定値に置き換える
///
/// 入れ子の設定にも再帰的に適用する。何度適用しても結果は変わらない。
pub trait Normalize {
    fn normalize(&mut self);
}

/// 値を受け取って正規化済みの値を返す
pub fn normalize<T: Normalize>(mut value: T) -> T {
    value.normalize();
    value
}

macro_rules! normalize_enum {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Normalize for $ty {
                fn normalize(&mut self) {
                    if matches!(self, Self::Unknown) {
                        tracing::debug!(
                            "🧹 Replacing unknown {} with default",
                            stringify!($ty)
                        );
                        *self = Self::default();
                    }
                }
            }
        )*
    };
}

/// レイアウトプリセット
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutPreset {
    #[default]
    Streaming,
    Talk,
    Music,
    Gaming,
    Custom,
    ThreeColumn,
    #[serde(other)]
    Unknown,
}

/// コメントオーバーレイの表示位置
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommentPosition {
    TopLeft,
    TopRight,
    #[default]
    BottomLeft,
    BottomRight,
    #[serde(other)]
    Unknown,
}

/// セットリストオーバーレイの表示位置
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetlistPosition {
    Top,
    #[default]
    Bottom,
    Left,
    Right,
    #[serde(other)]
    Unknown,
}

/// 天気ウィジェットの表示位置
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WeatherPosition {
    LeftTop,
    LeftBottom,
    #[default]
    RightTop,
    RightBottom,
    #[serde(other)]
    Unknown,
}

normalize_enum!(LayoutPreset, CommentPosition, SetlistPosition, WeatherPosition);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommonSettings {
    pub primary_color: String,
    pub font_family: String,
    pub border_radius: u32,
}

impl Default for CommonSettings {
    fn default() -> Self {
        Self {
            primary_color: "#6366f1".to_string(),
            font_family: "Noto Sans JP".to_string(),
            border_radius: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommentSettings {
    pub enabled: bool,
    pub position: CommentPosition,
    pub show_avatar: bool,
    pub font_size: u32,
}

impl Default for CommentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            position: CommentPosition::default(),
            show_avatar: true,
            font_size: 16,
        }
    }
}

impl Normalize for CommentSettings {
    fn normalize(&mut self) {
        self.position.normalize();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetlistSettings {
    pub enabled: bool,
    pub position: SetlistPosition,
    pub show_artist: bool,
    pub font_size: u32,
}

impl Default for SetlistSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            position: SetlistPosition::default(),
            show_artist: true,
            font_size: 24,
        }
    }
}

impl Normalize for SetlistSettings {
    fn normalize(&mut self) {
        self.position.normalize();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeatherSettings {
    pub enabled: bool,
    pub position: WeatherPosition,
}

impl Normalize for WeatherSettings {
    fn normalize(&mut self) {
        self.position.normalize();
    }
}

/// スーパーチャット表示設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SuperchatSettings {
    /// 同時表示数（1-3）
    pub max_display: u32,
    /// 表示時間（秒、10-120）
    pub display_duration_sec: u32,
    pub queue_enabled: bool,
}

impl Default for SuperchatSettings {
    fn default() -> Self {
        Self {
            max_display: 1,
            display_duration_sec: 60,
            queue_enabled: true,
        }
    }
}

impl Normalize for SuperchatSettings {
    fn normalize(&mut self) {
        self.max_display = self.max_display.clamp(1, 3);
        self.display_duration_sec = self.display_duration_sec.clamp(10, 120);
    }
}

/// オーバーレイ設定全体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OverlaySettings {
    pub theme: String,
    pub layout: LayoutPreset,
    pub common: CommonSettings,
    pub comment: CommentSettings,
    pub setlist: SetlistSettings,
    pub weather: WeatherSettings,
    pub superchat: SuperchatSettings,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            theme: "default".to_string(),
            layout: LayoutPreset::default(),
            common: CommonSettings::default(),
            comment: CommentSettings::default(),
            setlist: SetlistSettings::default(),
            weather: WeatherSettings::default(),
            superchat: SuperchatSettings::default(),
        }
    }
}

impl Normalize for OverlaySettings {
    fn normalize(&mut self) {
        if self.theme.trim().is_empty() {
            self.theme = "default".to_string();
        }
        self.layout.normalize();
        self.comment.normalize();
        self.setlist.normalize();
        self.weather.normalize();
        self.superchat.normalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_unknowns() -> OverlaySettings {
        serde_json::from_value(json!({
            "theme": "",
            "layout": "cinema-wide",
            "comment": {"enabled": false, "position": "middle-center", "showAvatar": false, "fontSize": 20},
            "setlist": {"position": "diagonal"},
            "weather": {"enabled": true, "position": "center"},
            "superchat": {"maxDisplay": 9, "displayDurationSec": 1, "queueEnabled": false}
        }))
        .unwrap()
    }

    #[test]
    fn test_unknown_values_are_captured() {
        let settings = with_unknowns();
        assert_eq!(settings.layout, LayoutPreset::Unknown);
        assert_eq!(settings.comment.position, CommentPosition::Unknown);
        assert_eq!(settings.setlist.position, SetlistPosition::Unknown);
        assert_eq!(settings.weather.position, WeatherPosition::Unknown);
        // 未指定のセクションは既定値
        assert_eq!(settings.common, CommonSettings::default());
    }

    #[test]
    fn test_normalize_rewrites_nested_unknowns() {
        let settings = normalize(with_unknowns());
        assert_eq!(settings.theme, "default");
        assert_eq!(settings.layout, LayoutPreset::Streaming);
        assert_eq!(settings.comment.position, CommentPosition::BottomLeft);
        assert_eq!(settings.setlist.position, SetlistPosition::Bottom);
        assert_eq!(settings.weather.position, WeatherPosition::RightTop);
        assert_eq!(settings.superchat.max_display, 3);
        assert_eq!(settings.superchat.display_duration_sec, 10);

        // 既知の値はそのまま
        assert!(!settings.comment.enabled);
        assert_eq!(settings.comment.font_size, 20);
        assert!(settings.weather.enabled);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = vec![
            with_unknowns(),
            OverlaySettings::default(),
            serde_json::from_value(json!({"layout": "three-column", "comment": {"position": "top-right"}}))
                .unwrap(),
        ];
        for sample in samples {
            let once = normalize(sample);
            let twice = normalize(once.clone());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_known_values_round_trip_wire_names() {
        let settings: OverlaySettings =
            serde_json::from_value(json!({"layout": "three-column", "comment": {"position": "top-right"}}))
                .unwrap();
        assert_eq!(settings.layout, LayoutPreset::ThreeColumn);
        assert_eq!(settings.comment.position, CommentPosition::TopRight);

        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(value["layout"], "three-column");
        assert_eq!(value["comment"]["position"], "top-right");
        assert_eq!(value["comment"]["showAvatar"], true);
    }
}
