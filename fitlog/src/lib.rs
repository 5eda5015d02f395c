//! Personal fitness, diet and music log.
//! Modules keep the core pure: every state operation takes the aggregate by value
//! and hands back the next one. Storage, probing and prefetching live at the edges.

pub mod model {
    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_with::{DefaultOnNull, serde_as};
    use std::{collections::BTreeMap, fmt, str::FromStr};

    /* ------------------------------- Keys ------------------------------- */

    /// Canonical `YYYY-MM-DD` key of a local calendar day.
    ///
    /// Kept as text so imported data with odd keys still loads; use
    /// [`crate::dates::parse_date_key`] to get a calendar date back.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DateKey(pub String);

    impl DateKey {
        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for DateKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl From<&str> for DateKey {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ItemId(pub String);

    impl fmt::Display for ItemId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /* ------------------------------ Weekdays ------------------------------ */

    /// The seven stable weekday labels, Sunday first.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub enum Weekday {
        Sun,
        Mon,
        Tue,
        Wed,
        Thu,
        Fri,
        Sat,
    }

    impl Weekday {
        pub const ALL: [Weekday; 7] = [
            Weekday::Sun,
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
        ];

        /// Storage label, also the JSON map key.
        pub fn label(self) -> &'static str {
            match self {
                Weekday::Sun => "Sun",
                Weekday::Mon => "Mon",
                Weekday::Tue => "Tue",
                Weekday::Wed => "Wed",
                Weekday::Thu => "Thu",
                Weekday::Fri => "Fri",
                Weekday::Sat => "Sat",
            }
        }

        pub fn display_name(self) -> &'static str {
            match self {
                Weekday::Sun => "Sunday",
                Weekday::Mon => "Monday",
                Weekday::Tue => "Tuesday",
                Weekday::Wed => "Wednesday",
                Weekday::Thu => "Thursday",
                Weekday::Fri => "Friday",
                Weekday::Sat => "Saturday",
            }
        }

        /// Accepts the short label or the full name, ignoring ASCII case.
        pub fn from_label(label: &str) -> Option<Self> {
            let label = label.trim();
            Self::ALL.into_iter().find(|day| {
                day.label().eq_ignore_ascii_case(label)
                    || day.display_name().eq_ignore_ascii_case(label)
            })
        }
    }

    impl From<chrono::Weekday> for Weekday {
        fn from(day: chrono::Weekday) -> Self {
            match day {
                chrono::Weekday::Sun => Weekday::Sun,
                chrono::Weekday::Mon => Weekday::Mon,
                chrono::Weekday::Tue => Weekday::Tue,
                chrono::Weekday::Wed => Weekday::Wed,
                chrono::Weekday::Thu => Weekday::Thu,
                chrono::Weekday::Fri => Weekday::Fri,
                chrono::Weekday::Sat => Weekday::Sat,
            }
        }
    }

    impl fmt::Display for Weekday {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.label())
        }
    }

    impl FromStr for Weekday {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Self::from_label(s).ok_or_else(|| format!("unknown weekday {s:?}"))
        }
    }

    /// A value for each of the seven weekdays.
    ///
    /// The table can only be built complete and only lets callers replace a single
    /// day's value, so it always holds exactly seven keys. Deserialization is lenient:
    /// missing or `null` days become `T::default()` and unknown keys are dropped.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Weekly<T> {
        slots: IndexMap<Weekday, T>,
    }

    impl<T> Weekly<T> {
        pub fn from_fn(mut f: impl FnMut(Weekday) -> T) -> Self {
            Self {
                slots: Weekday::ALL.into_iter().map(|day| (day, f(day))).collect(),
            }
        }

        pub fn get(&self, day: Weekday) -> &T {
            &self.slots[&day]
        }

        /// Replace one day's value, returning the previous one.
        pub fn set(&mut self, day: Weekday, value: T) -> T {
            std::mem::replace(&mut self.slots[&day], value)
        }

        pub fn iter(&self) -> impl Iterator<Item = (Weekday, &T)> {
            self.slots.iter().map(|(day, value)| (*day, value))
        }

        pub fn days(&self) -> impl Iterator<Item = Weekday> {
            self.slots.keys().copied()
        }

        pub fn len(&self) -> usize {
            self.slots.len()
        }

        pub fn is_empty(&self) -> bool {
            self.slots.is_empty()
        }
    }

    impl<T: Default> Default for Weekly<T> {
        fn default() -> Self {
            Self::from_fn(|_| T::default())
        }
    }

    impl<T: Serialize> Serialize for Weekly<T> {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            self.slots.serialize(serializer)
        }
    }

    impl<'de, T> Deserialize<'de> for Weekly<T>
    where
        T: Deserialize<'de> + Default,
    {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = IndexMap::<String, Option<T>>::deserialize(deserializer)?;
            let mut known: IndexMap<Weekday, T> = raw
                .into_iter()
                .filter_map(|(label, value)| {
                    Weekday::from_label(&label).map(|day| (day, value.unwrap_or_default()))
                })
                .collect();
            Ok(Self::from_fn(|day| known.swap_remove(&day).unwrap_or_default()))
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ChecklistItem {
        pub id: ItemId,
        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub text: String,
        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub done: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum MealSlot {
        Breakfast,
        Lunch,
        Dinner,
        Notes,
    }

    impl MealSlot {
        pub const ALL: [MealSlot; 4] = [
            MealSlot::Breakfast,
            MealSlot::Lunch,
            MealSlot::Dinner,
            MealSlot::Notes,
        ];

        pub fn name(self) -> &'static str {
            match self {
                MealSlot::Breakfast => "breakfast",
                MealSlot::Lunch => "lunch",
                MealSlot::Dinner => "dinner",
                MealSlot::Notes => "notes",
            }
        }
    }

    impl FromStr for MealSlot {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let s = s.trim();
            Self::ALL
                .into_iter()
                .find(|slot| slot.name().eq_ignore_ascii_case(s))
                .ok_or_else(|| format!("unknown meal slot {s:?} (breakfast, lunch, dinner, notes)"))
        }
    }

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Meals {
        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub breakfast: String,
        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub lunch: String,
        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub dinner: String,
        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub notes: String,
    }

    impl Meals {
        pub fn get(&self, slot: MealSlot) -> &str {
            match slot {
                MealSlot::Breakfast => &self.breakfast,
                MealSlot::Lunch => &self.lunch,
                MealSlot::Dinner => &self.dinner,
                MealSlot::Notes => &self.notes,
            }
        }

        pub fn get_mut(&mut self, slot: MealSlot) -> &mut String {
            match slot {
                MealSlot::Breakfast => &mut self.breakfast,
                MealSlot::Lunch => &mut self.lunch,
                MealSlot::Dinner => &mut self.dinner,
                MealSlot::Notes => &mut self.notes,
            }
        }
    }

    /// The editable text fields of an [`Entry`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum EntryField {
        Weight,
        Meal(MealSlot),
    }

    /// One day's record.
    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Entry {
        pub date: DateKey,
        /// Decimal text as typed; empty means unset.
        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub weight: String,
        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub meals: Meals,
        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub checklist: Vec<ChecklistItem>,
    }

    impl Entry {
        /// Weight as a number, accepting a decimal comma.
        pub fn weight_value(&self) -> Option<f64> {
            self.weight
                .trim()
                .replace(',', ".")
                .parse::<f64>()
                .ok()
                .filter(|w| w.is_finite())
        }

        /// `(done, total)` over the checklist.
        pub fn progress(&self) -> (usize, usize) {
            let done = self.checklist.iter().filter(|item| item.done).count();
            (done, self.checklist.len())
        }
    }

    /* ------------------------------ Settings ------------------------------ */

    pub const DEFAULT_GOAL_WEIGHT: f64 = 60.0;

    fn default_template(day: Weekday) -> Vec<String> {
        let lines: &[&str] = match day {
            Weekday::Sun => &["Stretching 15 min", "Easy walk 30 min"],
            Weekday::Mon => &["Squats 3x12", "Push-ups 3x10", "Plank 60 s"],
            Weekday::Tue => &["Jog 20 min", "Lunges 3x10", "Crunches 3x15"],
            Weekday::Wed => &["Yoga 30 min", "Glute bridges 3x15"],
            Weekday::Thu => &["Deadlifts 3x10", "Dumbbell rows 3x12", "Side plank 45 s"],
            Weekday::Fri => &["Cycling 30 min", "Burpees 3x8"],
            Weekday::Sat => &["Long walk 60 min", "Mobility 10 min"],
        };
        lines.iter().map(|line| line.to_string()).collect()
    }

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct Settings {
        #[serde(deserialize_with = "goal_or_default")]
        pub goal_weight: f64,
        /// Media URL per weekday; empty means none.
        #[serde_as(as = "DefaultOnNull")]
        pub weekly_music: Weekly<String>,
        /// Checklist texts per weekday.
        #[serde_as(as = "DefaultOnNull")]
        pub templates: Weekly<Vec<String>>,
    }

    fn goal_or_default<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(DEFAULT_GOAL_WEIGHT))
    }

    impl Settings {
        pub fn defaults() -> Self {
            Self {
                goal_weight: DEFAULT_GOAL_WEIGHT,
                weekly_music: Weekly::default(),
                templates: Weekly::from_fn(default_template),
            }
        }

        pub fn set_goal_weight(&mut self, goal: f64) {
            self.goal_weight = goal;
        }

        /// Replace one weekday's template; lines are trimmed and blank lines dropped.
        pub fn set_template<I, S>(&mut self, day: Weekday, lines: I)
        where
            I: IntoIterator<Item = S>,
            S: AsRef<str>,
        {
            let lines = lines
                .into_iter()
                .map(|line| line.as_ref().trim().to_string())
                .filter(|line| !line.is_empty())
                .collect();
            self.templates.set(day, lines);
        }

        /// Blank input clears the day's URL; anything else is stored normalized.
        pub fn set_weekly_music_url(&mut self, day: Weekday, raw: &str) {
            let trimmed = raw.trim();
            let value = if trimmed.is_empty() {
                String::new()
            } else {
                crate::media::normalize(trimmed)
            };
            self.weekly_music.set(day, value);
        }
    }

    impl Default for Settings {
        fn default() -> Self {
            Self::defaults()
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: every entry plus settings, persisted as one unit.
    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    pub struct AppState {
        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub entries: BTreeMap<DateKey, Entry>,
        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub settings: Settings,
    }

    impl AppState {
        pub fn entry(&self, key: &DateKey) -> Option<&Entry> {
            self.entries.get(key)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn defaults_cover_exactly_seven_weekdays() {
            let settings = Settings::defaults();
            assert_eq!(settings.templates.len(), 7);
            assert_eq!(settings.weekly_music.len(), 7);
            let days: Vec<Weekday> = settings.templates.days().collect();
            assert_eq!(days, Weekday::ALL.to_vec());
            for (day, lines) in settings.templates.iter() {
                assert!(!lines.is_empty(), "template for {day} is empty");
            }
            assert!(settings.weekly_music.iter().all(|(_, url)| url.is_empty()));
        }

        #[test]
        fn weekly_set_replaces_one_value_only() {
            let mut table: Weekly<String> = Weekly::default();
            let previous = table.set(Weekday::Wed, "x".into());
            assert_eq!(previous, "");
            assert_eq!(table.get(Weekday::Wed), "x");
            assert_eq!(table.len(), 7);
            assert_eq!(table.get(Weekday::Thu), "");
        }

        #[test]
        fn weekly_deserialization_keeps_seven_keys() {
            let json = r#"{"Mon":"a.mp3","tuesday":null,"Holiday":"b.mp3"}"#;
            let table: Weekly<String> = serde_json::from_str(json).expect("parse");
            assert_eq!(table.len(), 7);
            assert_eq!(table.get(Weekday::Mon), "a.mp3");
            assert_eq!(table.get(Weekday::Tue), "");
            assert_eq!(table.get(Weekday::Sun), "");
        }

        #[test]
        fn settings_use_camel_case_field_names() {
            let json = serde_json::to_value(Settings::defaults()).expect("encode");
            assert!(json.get("goalWeight").is_some());
            assert!(json.get("weeklyMusic").is_some());
            assert!(json["templates"].get("Sun").is_some());
        }

        #[test]
        fn state_tolerates_nulls_and_missing_fields() {
            let json = r#"{
                "entries": {
                    "2025-03-03": {
                        "date": "2025-03-03",
                        "weight": null,
                        "meals": {"breakfast": "oats", "lunch": null},
                        "checklist": [{"id": "a", "text": "Squats", "done": true}]
                    }
                }
            }"#;
            let state: AppState = serde_json::from_str(json).expect("parse");
            let entry = state.entry(&DateKey::from("2025-03-03")).expect("entry");
            assert_eq!(entry.weight, "");
            assert_eq!(entry.meals.breakfast, "oats");
            assert_eq!(entry.meals.lunch, "");
            assert!(entry.checklist[0].done);
            assert_eq!(state.settings, Settings::defaults());
        }

        #[test]
        fn null_goal_weight_falls_back_to_default() {
            let json = r#"{"goalWeight": null, "weeklyMusic": null}"#;
            let settings: Settings = serde_json::from_str(json).expect("parse");
            assert_eq!(settings.goal_weight, DEFAULT_GOAL_WEIGHT);

            let settings: Settings = serde_json::from_str(r#"{"goalWeight": 58.5}"#).expect("parse");
            assert_eq!(settings.goal_weight, 58.5);
        }

        #[test]
        fn weight_value_accepts_decimal_comma() {
            let mut entry = Entry {
                date: DateKey::from("2025-03-03"),
                weight: " 72,5 ".into(),
                meals: Meals::default(),
                checklist: vec![],
            };
            assert_eq!(entry.weight_value(), Some(72.5));
            entry.weight = "heavy".into();
            assert_eq!(entry.weight_value(), None);
        }

        #[test]
        fn weekday_and_meal_labels_parse() {
            assert_eq!("friday".parse::<Weekday>(), Ok(Weekday::Fri));
            assert_eq!("SAT".parse::<Weekday>(), Ok(Weekday::Sat));
            assert!("someday".parse::<Weekday>().is_err());
            assert_eq!("Dinner".parse::<MealSlot>(), Ok(MealSlot::Dinner));
        }
    }
}

pub mod dates {
    //! Calendar helpers. Keys always come from the local calendar day.

    use crate::model::{DateKey, Weekday};
    use chrono::{Datelike, Local, NaiveDate};
    use nom::{
        IResult,
        bytes::complete::take_while_m_n,
        character::complete::char,
        combinator::{all_consuming, map_opt, map_res},
        sequence::tuple,
    };

    pub fn canonical_date_key(date: NaiveDate) -> DateKey {
        DateKey(date.format("%Y-%m-%d").to_string())
    }

    /// Key of the caller's wall-clock day.
    pub fn today_key() -> DateKey {
        canonical_date_key(Local::now().date_naive())
    }

    pub fn parse_date_key(key: &DateKey) -> Option<NaiveDate> {
        all_consuming(parse_date)(key.as_str().trim())
            .ok()
            .map(|(_, date)| date)
    }

    /// Weekday of a key; `None` when the key is not a real `YYYY-MM-DD` date.
    pub fn weekday_label(key: &DateKey) -> Option<Weekday> {
        parse_date_key(key).map(|date| date.weekday().into())
    }

    fn parse_date(i: &str) -> IResult<&str, NaiveDate> {
        map_opt(
            tuple((
                map_res(take_while_m_n(4, 4, is_digit), |s: &str| s.parse::<i32>()),
                char('-'),
                map_res(take_while_m_n(2, 2, is_digit), |s: &str| s.parse::<u32>()),
                char('-'),
                map_res(take_while_m_n(2, 2, is_digit), |s: &str| s.parse::<u32>()),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d),
        )(i)
    }

    fn is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

}

pub mod media {
    //! Best-effort helpers for media links: rewrite share links into direct-fetch
    //! links and explain playback failures. Nothing here returns an error; bad
    //! input comes back unchanged or yields no information.

    use chrono::{DateTime, NaiveDate, Utc};
    use url::Url;

    const DROPBOX_HOSTS: &[&str] = &["dropbox.com", "www.dropbox.com"];
    const DRIVE_HOST: &str = "drive.google.com";
    const BLOB_HOST_SUFFIXES: &[&str] = &[".blob.core.windows.net", ".web.core.windows.net"];

    /// Status recorded when a request never produced a response (network or CORS).
    pub const NETWORK_FAILURE: u16 = 0;

    pub fn normalize(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() || is_relative(trimmed) {
            return trimmed.to_string();
        }
        let Ok(url) = Url::parse(trimmed) else {
            return trimmed.to_string();
        };
        if !matches!(url.scheme(), "http" | "https") {
            return trimmed.to_string();
        }

        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if DROPBOX_HOSTS.contains(&host.as_str()) {
            return dropbox_raw(url);
        }
        if host == DRIVE_HOST {
            if let Some(id) = drive_file_id(&url) {
                return drive_download(&id);
            }
        }
        url.to_string()
    }

    /// True for absolute `http(s)` URLs, the only ones we can fetch ourselves.
    pub fn is_fetchable(input: &str) -> bool {
        Url::parse(input.trim()).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
    }

    pub fn classify_blob_host(input: &str) -> bool {
        Url::parse(input.trim())
            .ok()
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
            .is_some_and(|host| BLOB_HOST_SUFFIXES.iter().any(|suffix| host.ends_with(suffix)))
    }

    pub fn diagnostic_hint(status: u16) -> Option<&'static str> {
        match status {
            404 => Some(
                "Blob not found: check the container name, the blob path and its letter case.",
            ),
            403 => Some(
                "Access denied: the container is private or the SAS token is invalid or expired. \
                 Allow anonymous blob read access or generate a new SAS with read permission.",
            ),
            NETWORK_FAILURE => Some(
                "No response: the storage account needs a CORS rule allowing GET and HEAD \
                 from this origin, or the host is unreachable.",
            ),
            _ => None,
        }
    }

    /// Pieces of an object-storage URL relevant to playback problems.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BlobUrlInfo {
        pub container: Option<String>,
        pub blob_path: String,
        pub has_blob_path: bool,
        pub has_signature: bool,
        pub signature_expiry: Option<DateTime<Utc>>,
        pub signature_expired: bool,
    }

    pub fn parse_blob_url(input: &str) -> Option<BlobUrlInfo> {
        parse_blob_url_at(input, Utc::now())
    }

    pub fn parse_blob_url_at(input: &str, now: DateTime<Utc>) -> Option<BlobUrlInfo> {
        let url = Url::parse(input.trim()).ok()?;
        let mut segments: Vec<&str> = url
            .path_segments()
            .map(|parts| parts.filter(|part| !part.is_empty()).collect())
            .unwrap_or_default();
        let container = if segments.is_empty() {
            None
        } else {
            Some(segments.remove(0).to_string())
        };
        let blob_path = segments.join("/");

        let mut has_signature = false;
        let mut signature_expiry = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "sig" => has_signature = true,
                "se" => signature_expiry = parse_expiry(&value),
                _ => {}
            }
        }

        Some(BlobUrlInfo {
            container,
            has_blob_path: !blob_path.is_empty(),
            blob_path,
            has_signature,
            signature_expired: signature_expiry.is_some_and(|expiry| expiry <= now),
            signature_expiry,
        })
    }

    fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(value, "%Y-%m-%d")
                    .ok()
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc())
            })
    }

    fn is_relative(s: &str) -> bool {
        s.starts_with('/') || s.starts_with("./") || s.starts_with("../")
    }

    fn dropbox_raw(mut url: Url) -> String {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "dl" && key != "raw")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("raw", "1");
        url.to_string()
    }

    fn drive_file_id(url: &Url) -> Option<String> {
        let from_path = url.path_segments().and_then(|parts| {
            let parts: Vec<&str> = parts.collect();
            parts
                .windows(2)
                .find(|pair| pair[0] == "d" && !pair[1].is_empty())
                .map(|pair| pair[1].to_string())
        });
        from_path.or_else(|| {
            url.query_pairs()
                .find(|(key, value)| key == "id" && !value.is_empty())
                .map(|(_, value)| value.into_owned())
        })
    }

    fn drive_download(id: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("export", "download")
            .append_pair("id", id)
            .finish();
        format!("https://{DRIVE_HOST}/uc?{query}")
    }

}

pub mod factory {
    //! Builds fresh entries from the weekday templates.

    use crate::model::{ChecklistItem, DateKey, Entry, ItemId, Meals, Settings};
    use crate::dates::weekday_label;
    use uuid::Uuid;

    /// Template lines for the weekday of `key`; empty for malformed keys.
    pub fn template_for<'a>(key: &DateKey, settings: &'a Settings) -> &'a [String] {
        match weekday_label(key) {
            Some(day) => settings.templates.get(day),
            None => &[],
        }
    }

    pub fn build_entry(key: &DateKey, settings: &Settings) -> Entry {
        Entry {
            date: key.clone(),
            weight: String::new(),
            meals: Meals::default(),
            checklist: build_checklist(key, settings),
        }
    }

    /// Fresh unchecked items with never-before-seen ids.
    pub fn build_checklist(key: &DateKey, settings: &Settings) -> Vec<ChecklistItem> {
        template_for(key, settings)
            .iter()
            .enumerate()
            .map(|(index, text)| ChecklistItem {
                id: mint_item_id(key, index),
                text: text.clone(),
                done: false,
            })
            .collect()
    }

    pub fn mint_item_id(key: &DateKey, index: usize) -> ItemId {
        ItemId(format!("{key}-{index}-{}", Uuid::new_v4().simple()))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::model::Weekday;
        use std::collections::BTreeSet;

        fn monday() -> DateKey {
            DateKey::from("2025-03-03")
        }

        #[test]
        fn checklist_follows_weekday_template() {
            let settings = Settings::defaults();
            let entry = build_entry(&monday(), &settings);
            let template = settings.templates.get(Weekday::Mon);
            assert_eq!(entry.checklist.len(), template.len());
            assert!(entry.checklist.iter().all(|item| !item.done));
            let texts: Vec<&String> = entry.checklist.iter().map(|item| &item.text).collect();
            assert_eq!(texts, template.iter().collect::<Vec<_>>());
            assert_eq!(entry.weight, "");
            assert_eq!(entry.meals, Meals::default());
        }

        #[test]
        fn every_weekday_template_is_applied() {
            let settings = Settings::defaults();
            for offset in 0..7u32 {
                let key = DateKey(format!("2025-03-{:02}", 2 + offset));
                let day = weekday_label(&key).expect("valid");
                let entry = build_entry(&key, &settings);
                assert_eq!(entry.checklist.len(), settings.templates.get(day).len());
            }
        }

        #[test]
        fn rebuilding_mints_disjoint_ids() {
            let settings = Settings::defaults();
            let first = build_entry(&monday(), &settings);
            let second = build_entry(&monday(), &settings);

            let texts = |e: &Entry| e.checklist.iter().map(|i| i.text.clone()).collect::<Vec<_>>();
            assert_eq!(texts(&first), texts(&second));

            let ids_a: BTreeSet<&ItemId> = first.checklist.iter().map(|i| &i.id).collect();
            let ids_b: BTreeSet<&ItemId> = second.checklist.iter().map(|i| &i.id).collect();
            assert_eq!(ids_a.len(), first.checklist.len());
            assert!(ids_a.is_disjoint(&ids_b));
        }

        #[test]
        fn malformed_key_gets_empty_checklist() {
            let entry = build_entry(&DateKey::from("someday"), &Settings::defaults());
            assert!(entry.checklist.is_empty());
            assert_eq!(entry.date.as_str(), "someday");
        }

        #[test]
        fn item_ids_carry_the_date() {
            let id = mint_item_id(&monday(), 4);
            assert!(id.0.starts_with("2025-03-03-4-"));
        }
    }
}

pub mod ops {
    //! State operations. Each takes the whole aggregate and returns the next one;
    //! entry mutations reconcile first so editing a day implicitly creates it.

    use crate::model::{AppState, ChecklistItem, DateKey, Entry, EntryField, ItemId, MealSlot};
    use crate::model::{Settings, Weekday};
    use crate::factory::{build_checklist, build_entry, mint_item_id};
    use tracing::{debug, info};

    /// Create the entry for `key` from the template unless it already exists.
    /// Existing user data is never touched.
    pub fn ensure_entry(mut state: AppState, key: &DateKey) -> AppState {
        if !state.entries.contains_key(key) {
            let entry = build_entry(key, &state.settings);
            debug!(date = %key, items = entry.checklist.len(), "created entry from template");
            state.entries.insert(key.clone(), entry);
        }
        state
    }

    /// Discard whatever the day holds and start over from the template.
    pub fn reset_entry(mut state: AppState, key: &DateKey) -> AppState {
        let entry = build_entry(key, &state.settings);
        debug!(date = %key, "reset entry");
        state.entries.insert(key.clone(), entry);
        state
    }

    /// Rebuild only the checklist; weight and meals stay.
    pub fn reapply_template(state: AppState, key: &DateKey) -> AppState {
        let mut state = ensure_entry(state, key);
        let checklist = build_checklist(key, &state.settings);
        if let Some(entry) = state.entries.get_mut(key) {
            debug!(date = %key, items = checklist.len(), "reapplied template");
            entry.checklist = checklist;
        }
        state
    }

    pub fn update_field(
        state: AppState,
        key: &DateKey,
        field: EntryField,
        value: impl Into<String>,
    ) -> AppState {
        let value = value.into();
        with_entry(state, key, |entry| {
            debug!(date = %entry.date, ?field, "updated field");
            match field {
                EntryField::Weight => entry.weight = value,
                EntryField::Meal(slot) => *entry.meals.get_mut(slot) = value,
            }
        })
    }

    pub fn update_meals(
        state: AppState,
        key: &DateKey,
        slot: MealSlot,
        value: impl Into<String>,
    ) -> AppState {
        update_field(state, key, EntryField::Meal(slot), value)
    }

    pub fn toggle_checklist_item(state: AppState, key: &DateKey, id: &ItemId) -> AppState {
        with_entry(state, key, |entry| {
            if let Some(item) = entry.checklist.iter_mut().find(|item| &item.id == id) {
                item.done = !item.done;
                debug!(%id, done = item.done, "toggled checklist item");
            }
        })
    }

    /// Append an item; blank text is ignored.
    pub fn add_checklist_item(state: AppState, key: &DateKey, text: &str) -> AppState {
        let text = text.trim();
        with_entry(state, key, |entry| {
            if text.is_empty() {
                return;
            }
            let id = mint_item_id(&entry.date, entry.checklist.len());
            debug!(%id, "added checklist item");
            entry.checklist.push(ChecklistItem {
                id,
                text: text.to_string(),
                done: false,
            });
        })
    }

    pub fn remove_checklist_item(state: AppState, key: &DateKey, id: &ItemId) -> AppState {
        with_entry(state, key, |entry| {
            let before = entry.checklist.len();
            entry.checklist.retain(|item| &item.id != id);
            if entry.checklist.len() != before {
                debug!(%id, "removed checklist item");
            }
        })
    }

    pub fn set_weekly_music_url(mut settings: Settings, day: Weekday, raw: &str) -> Settings {
        settings.set_weekly_music_url(day, raw);
        debug!(%day, url = %settings.weekly_music.get(day), "set weekly music url");
        settings
    }

    /// Apply a settings change to the aggregate.
    pub fn with_settings(mut state: AppState, f: impl FnOnce(Settings) -> Settings) -> AppState {
        let settings = std::mem::take(&mut state.settings);
        state.settings = f(settings);
        state
    }

    /// Install externally supplied data as the new state, unvalidated.
    pub fn replace_whole_state(data: AppState) -> AppState {
        info!(entries = data.entries.len(), "replaced whole state");
        data
    }

    fn with_entry(state: AppState, key: &DateKey, f: impl FnOnce(&mut Entry)) -> AppState {
        let mut state = ensure_entry(state, key);
        if let Some(entry) = state.entries.get_mut(key) {
            f(entry);
        }
        state
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn key() -> DateKey {
            DateKey::from("2025-03-03")
        }

        fn fresh() -> AppState {
            ensure_entry(AppState::default(), &key())
        }

        fn entry(state: &AppState) -> &Entry {
            state.entry(&key()).expect("entry exists")
        }

        #[test]
        fn ensure_is_idempotent_and_keeps_edits() {
            let once = fresh();
            let twice = ensure_entry(once.clone(), &key());
            assert_eq!(once, twice);

            let edited = update_field(twice, &key(), EntryField::Weight, "71.2");
            let first_id = entry(&edited).checklist[0].id.clone();
            let edited = toggle_checklist_item(edited, &key(), &first_id);
            let again = ensure_entry(edited.clone(), &key());
            assert_eq!(again, edited);
            assert_eq!(entry(&again).weight, "71.2");
            assert!(entry(&again).checklist[0].done);
        }

        #[test]
        fn mutation_creates_missing_entry() {
            let state = update_meals(AppState::default(), &key(), MealSlot::Lunch, "salad");
            let e = entry(&state);
            assert_eq!(e.meals.lunch, "salad");
            assert!(!e.checklist.is_empty());
        }

        #[test]
        fn reset_restores_blank_defaults() {
            let mut state = fresh();
            state = update_field(state, &key(), EntryField::Weight, "70");
            state = update_meals(state, &key(), MealSlot::Dinner, "soup");
            let id = entry(&state).checklist[0].id.clone();
            state = toggle_checklist_item(state, &key(), &id);
            state = add_checklist_item(state, &key(), "extra");

            let reset = reset_entry(state, &key());
            let e = entry(&reset);
            assert_eq!(e.weight, "");
            assert_eq!(e.meals, crate::model::Meals::default());
            assert!(e.checklist.iter().all(|item| !item.done));
            assert!(e.checklist.iter().all(|item| item.id != id));
            assert_eq!(e.checklist.len(), reset.settings.templates.get(Weekday::Mon).len());
        }

        #[test]
        fn reapply_replaces_only_the_checklist() {
            let mut state = fresh();
            state = update_field(state, &key(), EntryField::Weight, "69.9");
            state = update_meals(state, &key(), MealSlot::Breakfast, "eggs");
            let old_ids: Vec<ItemId> = entry(&state).checklist.iter().map(|i| i.id.clone()).collect();

            let state = reapply_template(state, &key());
            let e = entry(&state);
            assert_eq!(e.weight, "69.9");
            assert_eq!(e.meals.breakfast, "eggs");
            assert_eq!(e.checklist.len(), old_ids.len());
            assert!(e.checklist.iter().all(|item| !old_ids.contains(&item.id)));
        }

        #[test]
        fn blank_item_text_is_ignored() {
            let state = fresh();
            let before = entry(&state).checklist.len();
            let state = add_checklist_item(state, &key(), "   \t");
            assert_eq!(entry(&state).checklist.len(), before);
            let state = add_checklist_item(state, &key(), "");
            assert_eq!(entry(&state).checklist.len(), before);
        }

        #[test]
        fn adding_item_appends_one() {
            let state = fresh();
            let before = entry(&state).checklist.len();
            let state = add_checklist_item(state, &key(), "new item");
            let e = entry(&state);
            assert_eq!(e.checklist.len(), before + 1);
            let last = e.checklist.last().expect("item");
            assert_eq!(last.text, "new item");
            assert!(!last.done);
        }

        #[test]
        fn removing_items() {
            let state = fresh();
            let before = entry(&state).checklist.len();
            let id = entry(&state).checklist[0].id.clone();

            let state = remove_checklist_item(state, &key(), &id);
            assert_eq!(entry(&state).checklist.len(), before - 1);

            let state = remove_checklist_item(state, &key(), &ItemId("missing".into()));
            assert_eq!(entry(&state).checklist.len(), before - 1);
        }

        #[test]
        fn toggle_unknown_id_changes_nothing() {
            let state = fresh();
            let toggled = toggle_checklist_item(state.clone(), &key(), &ItemId("nope".into()));
            assert_eq!(state, toggled);
        }

        #[test]
        fn weekly_music_url_is_trimmed_and_normalized() {
            let settings = set_weekly_music_url(
                Settings::defaults(),
                Weekday::Mon,
                "  https://www.dropbox.com/s/abc/mon.mp3?dl=0 ",
            );
            assert_eq!(
                settings.weekly_music.get(Weekday::Mon),
                "https://www.dropbox.com/s/abc/mon.mp3?raw=1"
            );
            let settings = set_weekly_music_url(settings, Weekday::Mon, "   ");
            assert_eq!(settings.weekly_music.get(Weekday::Mon), "");
            assert_eq!(settings.weekly_music.len(), 7);
        }

        #[test]
        fn settings_changes_leave_entries_alone() {
            let state = update_field(fresh(), &key(), EntryField::Weight, "70");
            let state = with_settings(state, |mut s| {
                s.set_goal_weight(65.0);
                s.set_template(Weekday::Mon, ["Row 2k", " ", "Pull-ups 3x5"]);
                s
            });
            assert_eq!(state.settings.goal_weight, 65.0);
            assert_eq!(state.settings.templates.get(Weekday::Mon).len(), 2);
            assert_eq!(entry(&state).weight, "70");
            assert_eq!(entry(&state).checklist.len(), 3);
        }

        #[test]
        fn whole_state_replacement_is_verbatim() {
            let imported = update_field(AppState::default(), &key(), EntryField::Weight, "80");
            let state = replace_whole_state(imported.clone());
            assert_eq!(state, imported);
        }
    }
}

pub mod storage {
    //! Where the aggregate lives between runs: one blob under a versioned name.
    //! Changing the stored shape incompatibly means bumping the version; data under
    //! an older name is simply never read.

    use std::{
        fs, io,
        path::{Path, PathBuf},
    };

    pub const STORAGE_KEY: &str = "fitlog.state.v1";

    pub fn state_file_name() -> String {
        format!("{STORAGE_KEY}.json")
    }

    pub trait StateRepository {
        /// The stored blob, `None` when nothing was saved yet.
        fn read(&self) -> io::Result<Option<String>>;

        /// Replace the stored blob.
        fn write(&mut self, blob: &str) -> io::Result<()>;
    }

    #[derive(Debug, Clone)]
    pub struct FileRepository {
        path: PathBuf,
    }

    impl FileRepository {
        pub fn in_dir(dir: &Path) -> Self {
            Self {
                path: dir.join(state_file_name()),
            }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl StateRepository for FileRepository {
        fn read(&self) -> io::Result<Option<String>> {
            match fs::read_to_string(&self.path) {
                Ok(blob) => Ok(Some(blob)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err),
            }
        }

        fn write(&mut self, blob: &str) -> io::Result<()> {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)?;
            }
            // Write aside then rename so a crash never leaves half a state behind.
            let staging = self.path.with_extension("json.tmp");
            fs::write(&staging, blob)?;
            fs::rename(&staging, &self.path)
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct MemoryRepository {
        blob: Option<String>,
    }

    impl MemoryRepository {
        pub fn with_blob(blob: impl Into<String>) -> Self {
            Self {
                blob: Some(blob.into()),
            }
        }

        pub fn blob(&self) -> Option<&str> {
            self.blob.as_deref()
        }
    }

    impl StateRepository for MemoryRepository {
        fn read(&self) -> io::Result<Option<String>> {
            Ok(self.blob.clone())
        }

        fn write(&mut self, blob: &str) -> io::Result<()> {
            self.blob = Some(blob.to_string());
            Ok(())
        }
    }

}

pub mod store {
    //! The single owner of the current [`AppState`].

    use crate::model::{AppState, DateKey};
    use crate::ops::replace_whole_state;
    use crate::storage::StateRepository;
    use tracing::{debug, info, warn};

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("storage I/O failed")]
        Io(#[from] std::io::Error),
        #[error("encoding state failed")]
        Encode(#[source] serde_json::Error),
        #[error("import data is not a valid state: {0}")]
        Import(#[source] serde_json::Error),
    }

    pub struct Store<R> {
        repo: R,
        state: AppState,
    }

    impl<R: StateRepository> Store<R> {
        pub fn open(repo: R) -> Self {
            let state = load(&repo);
            Self { repo, state }
        }

        /// Read-only view for rendering.
        pub fn snapshot(&self) -> &AppState {
            &self.state
        }

        pub fn repository(&self) -> &R {
            &self.repo
        }

        pub fn persist(&mut self) -> Result<(), StoreError> {
            save(&mut self.repo, &self.state)
        }

        /// Run one operation over the whole state and persist the result. The
        /// result is installed only once it has been written.
        pub fn apply(
            &mut self,
            op: impl FnOnce(AppState) -> AppState,
        ) -> Result<&AppState, StoreError> {
            let next = op(self.state.clone());
            save(&mut self.repo, &next)?;
            self.state = next;
            Ok(&self.state)
        }

        pub fn export_json(&self) -> Result<String, StoreError> {
            let text = serde_json::to_string_pretty(&self.state).map_err(StoreError::Encode)?;
            info!(entries = self.state.entries.len(), "exported state");
            Ok(text)
        }

        /// Parse `text` and install it. On a parse error the current state stays.
        pub fn import_json(&mut self, text: &str) -> Result<&AppState, StoreError> {
            let parsed: AppState = serde_json::from_str(text).map_err(StoreError::Import)?;
            info!(entries = parsed.entries.len(), "importing state");
            self.apply(|_| replace_whole_state(parsed))
        }
    }

    fn save(repo: &mut impl StateRepository, state: &AppState) -> Result<(), StoreError> {
        let blob = serde_json::to_string(state).map_err(StoreError::Encode)?;
        repo.write(&blob)?;
        info!(bytes = blob.len(), "persisted state");
        Ok(())
    }

    /// Stored state, or defaults when it is absent or unreadable.
    pub fn load(repo: &impl StateRepository) -> AppState {
        match repo.read() {
            Ok(Some(blob)) => match serde_json::from_str(&blob) {
                Ok(state) => state,
                Err(err) => {
                    warn!(%err, "stored state is corrupt; starting from defaults");
                    AppState::default()
                }
            },
            Ok(None) => {
                debug!("no stored state; starting from defaults");
                AppState::default()
            }
            Err(err) => {
                warn!(%err, "could not read stored state; starting from defaults");
                AppState::default()
            }
        }
    }

    pub fn export_file_name(today: &DateKey) -> String {
        format!("fitlog-export-{today}.json")
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::model::{EntryField, Settings};
        use crate::ops::{ensure_entry, update_field};
        use crate::storage::{FileRepository, MemoryRepository};

        fn key() -> DateKey {
            DateKey::from("2025-03-03")
        }

        #[test]
        fn absent_or_corrupt_storage_loads_defaults() {
            let store = Store::open(MemoryRepository::default());
            assert!(store.snapshot().entries.is_empty());
            assert_eq!(store.snapshot().settings, Settings::defaults());

            let store = Store::open(MemoryRepository::with_blob("{not json"));
            assert_eq!(store.snapshot(), &AppState::default());
        }

        #[test]
        fn apply_persists_every_change() {
            let mut store = Store::open(MemoryRepository::default());
            store
                .apply(|s| update_field(s, &key(), EntryField::Weight, "72"))
                .expect("apply");

            let blob = store.repository().blob().expect("written").to_string();
            let reopened = Store::open(MemoryRepository::with_blob(blob));
            assert_eq!(reopened.snapshot(), store.snapshot());
            assert_eq!(reopened.snapshot().entry(&key()).expect("entry").weight, "72");
        }

        #[test]
        fn failed_import_leaves_state_untouched() {
            let mut store = Store::open(MemoryRepository::default());
            store.apply(|s| ensure_entry(s, &key())).expect("apply");
            let before = store.snapshot().clone();

            let err = store.import_json("[1, 2, 3]").expect_err("rejects");
            assert!(matches!(err, StoreError::Import(_)));
            assert_eq!(store.snapshot(), &before);
        }

        struct FullDisk;

        impl StateRepository for FullDisk {
            fn read(&self) -> std::io::Result<Option<String>> {
                Ok(None)
            }

            fn write(&mut self, _blob: &str) -> std::io::Result<()> {
                Err(std::io::Error::other("disk full"))
            }
        }

        #[test]
        fn failed_write_keeps_previous_state() {
            let mut store = Store::open(FullDisk);
            let err = store
                .apply(|s| ensure_entry(s, &key()))
                .expect_err("write fails");
            assert!(matches!(err, StoreError::Io(_)));
            assert!(store.snapshot().entries.is_empty());

            let mut source = Store::open(MemoryRepository::default());
            source.apply(|s| ensure_entry(s, &key())).expect("apply");
            let text = source.export_json().expect("export");
            assert!(matches!(store.import_json(&text), Err(StoreError::Io(_))));
            assert_eq!(store.snapshot(), &AppState::default());
        }

        #[test]
        fn export_then_import_through_a_file() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut source = Store::open(FileRepository::in_dir(&tmp.path().join("a")));
            source
                .apply(|s| update_field(s, &key(), EntryField::Weight, "68.4"))
                .expect("apply");
            let export_path = tmp.path().join(export_file_name(&key()));
            std::fs::write(&export_path, source.export_json().expect("export")).expect("write");

            let mut target = Store::open(FileRepository::in_dir(&tmp.path().join("b")));
            let text = std::fs::read_to_string(&export_path).expect("read");
            target.import_json(&text).expect("import");
            assert_eq!(target.snapshot(), source.snapshot());

            let reopened = Store::open(FileRepository::in_dir(&tmp.path().join("b")));
            assert_eq!(reopened.snapshot(), source.snapshot());
        }

        #[test]
        fn export_file_is_named_by_date() {
            assert_eq!(export_file_name(&key()), "fitlog-export-2025-03-03.json");
        }
    }
}

pub mod config {
    //! Where data and cache files go.

    use crate::storage::state_file_name;
    use anyhow::{Context, Result};
    use directories::ProjectDirs;
    use std::path::PathBuf;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Config {
        pub data_dir: PathBuf,
        pub cache_dir: PathBuf,
    }

    impl Config {
        /// Explicit directories win; the rest fall back to the platform's
        /// per-user locations.
        pub fn resolve(data_dir: Option<PathBuf>, cache_dir: Option<PathBuf>) -> Result<Self> {
            let (data_dir, cache_dir) = match (data_dir, cache_dir) {
                (Some(data), Some(cache)) => (data, cache),
                (data, cache) => {
                    let dirs = ProjectDirs::from("dev", "fitlog", "fitlog")
                        .context("no home directory found; pass --data-dir and --cache-dir")?;
                    (
                        data.unwrap_or_else(|| dirs.data_dir().to_path_buf()),
                        cache.unwrap_or_else(|| dirs.cache_dir().to_path_buf()),
                    )
                }
            };
            Ok(Self {
                data_dir,
                cache_dir,
            })
        }

        pub fn state_path(&self) -> PathBuf {
            self.data_dir.join(state_file_name())
        }
    }

}

pub mod diagnose {
    //! Media playback diagnostics: a couple of HTTP attempts against a URL and the
    //! hints they imply. Results only ever feed a message, never the state.

    use crate::media::{
        NETWORK_FAILURE, classify_blob_host, diagnostic_hint, is_fetchable, normalize,
        parse_blob_url_at,
    };
    use chrono::{DateTime, Utc};
    use reqwest::header::{CONTENT_TYPE, RANGE};
    use tracing::debug;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ProbeMethod {
        Head,
        RangedGet,
    }

    impl ProbeMethod {
        fn name(self) -> &'static str {
            match self {
                ProbeMethod::Head => "HEAD",
                ProbeMethod::RangedGet => "GET (first bytes)",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ProbeAttempt {
        pub method: ProbeMethod,
        /// HTTP status, or [`NETWORK_FAILURE`] when no response arrived.
        pub status: u16,
        pub content_type: Option<String>,
    }

    impl ProbeAttempt {
        pub fn succeeded(&self) -> bool {
            (200..300).contains(&self.status)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ProbeReport {
        pub url: String,
        pub attempts: Vec<ProbeAttempt>,
        pub playable: bool,
        pub hints: Vec<String>,
    }

    impl ProbeReport {
        pub fn summary(&self) -> String {
            let mut lines = vec![self.url.clone()];
            for attempt in &self.attempts {
                let status = if attempt.status == NETWORK_FAILURE {
                    "no response".to_string()
                } else {
                    attempt.status.to_string()
                };
                let content_type = attempt
                    .content_type
                    .as_deref()
                    .map(|ct| format!(" ({ct})"))
                    .unwrap_or_default();
                lines.push(format!("  {}: {status}{content_type}", attempt.method.name()));
            }
            lines.push(if self.playable {
                "  looks playable".to_string()
            } else {
                "  not playable".to_string()
            });
            for hint in &self.hints {
                lines.push(format!("  hint: {hint}"));
            }
            lines.join("\n")
        }
    }

    /// Turn observed attempts into a report. Pure; `now` decides SAS expiry.
    pub fn build_report(url: &str, attempts: Vec<ProbeAttempt>, now: DateTime<Utc>) -> ProbeReport {
        let mut hints = Vec::new();
        if !is_fetchable(url) {
            hints.push(
                "Relative or non-HTTP link: it can only be checked from the site that hosts it."
                    .to_string(),
            );
            return ProbeReport {
                url: url.to_string(),
                attempts,
                playable: false,
                hints,
            };
        }

        let playable = attempts.iter().any(ProbeAttempt::succeeded);
        let blob = classify_blob_host(url);
        let final_status = attempts.last().map_or(NETWORK_FAILURE, |a| a.status);

        if !playable {
            match (blob, diagnostic_hint(final_status)) {
                (true, Some(hint)) => hints.push(hint.to_string()),
                _ if final_status == NETWORK_FAILURE => hints.push(
                    "No response: the host is unreachable or refuses cross-origin requests."
                        .to_string(),
                ),
                _ => hints.push(format!("Server answered HTTP {final_status}.")),
            }
        }

        if blob {
            if let Some(info) = parse_blob_url_at(url, now) {
                if !info.has_blob_path {
                    hints.push(
                        "The link names a container but no blob; append the file path.".to_string(),
                    );
                }
                if info.signature_expired {
                    if let Some(expiry) = info.signature_expiry {
                        hints.push(format!(
                            "The SAS token expired at {}; generate a new one.",
                            expiry.to_rfc3339()
                        ));
                    }
                }
            }
        }

        if playable {
            let served = attempts
                .iter()
                .filter(|a| a.succeeded())
                .find_map(|a| a.content_type.as_deref());
            if let Some(ct) = served {
                let ct = ct.to_ascii_lowercase();
                let media = ["audio/", "video/", "application/octet-stream"]
                    .iter()
                    .any(|prefix| ct.starts_with(prefix));
                if !media {
                    hints.push(format!(
                        "The server sends {ct}, which a media element may refuse to play."
                    ));
                }
            }
        }

        if normalize(url) != url {
            hints.push("This is a share page link; save it again to store the direct link.".to_string());
        }

        ProbeReport {
            url: url.to_string(),
            attempts,
            playable,
            hints,
        }
    }

    /// HEAD first; when that fails, a ranged GET, since some hosts reject HEAD.
    pub async fn probe(client: &reqwest::Client, url: &str) -> ProbeReport {
        let url = url.trim();
        if !is_fetchable(url) {
            return build_report(url, Vec::new(), Utc::now());
        }

        let mut attempts = Vec::new();
        let head = attempt(client.head(url), ProbeMethod::Head).await;
        let done = head.succeeded();
        attempts.push(head);
        if !done {
            let get = client.get(url).header(RANGE, "bytes=0-1");
            attempts.push(attempt(get, ProbeMethod::RangedGet).await);
        }
        build_report(url, attempts, Utc::now())
    }

    async fn attempt(request: reqwest::RequestBuilder, method: ProbeMethod) -> ProbeAttempt {
        match request.send().await {
            Ok(response) => ProbeAttempt {
                method,
                status: response.status().as_u16(),
                content_type: response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string),
            },
            Err(err) => {
                debug!(%err, ?method, "probe attempt failed");
                ProbeAttempt {
                    method,
                    status: NETWORK_FAILURE,
                    content_type: None,
                }
            }
        }
    }

    /// Handle for one probe started on a [`DiagnosticBoard`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProbeTicket(u64);

    /// Holds the message of the most recently started probe. Results from probes
    /// that were superseded before they finished are dropped.
    #[derive(Debug, Default)]
    pub struct DiagnosticBoard {
        issued: u64,
        message: Option<String>,
    }

    impl DiagnosticBoard {
        pub fn begin(&mut self) -> ProbeTicket {
            self.issued += 1;
            ProbeTicket(self.issued)
        }

        /// Returns whether the message was shown.
        pub fn finish(&mut self, ticket: ProbeTicket, message: String) -> bool {
            if ticket.0 != self.issued {
                debug!(ticket = ticket.0, latest = self.issued, "dropping stale probe result");
                return false;
            }
            self.message = Some(message);
            true
        }

        pub fn message(&self) -> Option<&str> {
            self.message.as_deref()
        }
    }

}

pub mod prefetch {
    //! Fire-and-forget media prefetching. Callers hand requests to a [`Prefetcher`]
    //! and never wait for or learn about the outcome.

    use crate::model::Settings;
    use crate::media::is_fetchable;
    use anyhow::{Context, Result};
    use std::path::{Path, PathBuf};
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
    use tokio::task::JoinHandle;
    use tracing::{debug, info, warn};
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum PrefetchRequest {
        One(String),
        Many(Vec<String>),
    }

    impl PrefetchRequest {
        pub fn into_urls(self) -> Vec<String> {
            match self {
                PrefetchRequest::One(url) => vec![url],
                PrefetchRequest::Many(urls) => urls,
            }
        }
    }

    pub trait Prefetcher {
        fn request(&self, request: PrefetchRequest);
    }

    impl Prefetcher for UnboundedSender<PrefetchRequest> {
        fn request(&self, request: PrefetchRequest) {
            if self.send(request).is_err() {
                debug!("prefetch worker is gone; request dropped");
            }
        }
    }

    /// Every fetchable weekly music URL, deduplicated, in weekday order.
    pub fn weekly_music_request(settings: &Settings) -> Option<PrefetchRequest> {
        let mut urls: Vec<String> = Vec::new();
        for (_, url) in settings.weekly_music.iter() {
            if is_fetchable(url) && !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        match urls.len() {
            0 => None,
            1 => urls.pop().map(PrefetchRequest::One),
            _ => Some(PrefetchRequest::Many(urls)),
        }
    }

    /// Stable cache file name for a URL, keeping a short extension when present.
    pub fn cache_file_name(url: &str) -> String {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes());
        let extension = url
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .filter(|ext| {
                !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric())
            });
        match extension {
            Some(ext) => format!("{id}.{}", ext.to_ascii_lowercase()),
            None => id.to_string(),
        }
    }

    #[derive(Debug, Default)]
    pub struct PrefetchSummary {
        pub cached: Vec<PathBuf>,
        pub failed: Vec<(String, String)>,
    }

    /// Start a worker that downloads requested URLs into `cache_dir`. It stops once
    /// every sender is dropped and reports what it did.
    pub fn spawn_worker(
        client: reqwest::Client,
        cache_dir: PathBuf,
    ) -> (UnboundedSender<PrefetchRequest>, JoinHandle<PrefetchSummary>) {
        let (tx, rx) = unbounded_channel();
        let handle = tokio::spawn(run_worker(rx, client, cache_dir));
        (tx, handle)
    }

    async fn run_worker(
        mut rx: UnboundedReceiver<PrefetchRequest>,
        client: reqwest::Client,
        cache_dir: PathBuf,
    ) -> PrefetchSummary {
        let mut summary = PrefetchSummary::default();
        while let Some(request) = rx.recv().await {
            for url in request.into_urls() {
                match fetch_into(&client, &url, &cache_dir).await {
                    Ok(path) => {
                        info!(%url, path = %path.display(), "cached media");
                        summary.cached.push(path);
                    }
                    Err(err) => {
                        warn!(%url, error = %format!("{err:#}"), "prefetch failed");
                        summary.failed.push((url, format!("{err:#}")));
                    }
                }
            }
        }
        summary
    }

    async fn fetch_into(client: &reqwest::Client, url: &str, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(cache_file_name(url));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(%url, "already cached");
            return Ok(path);
        }
        let bytes = client
            .get(url)
            .send()
            .await
            .context("requesting media")?
            .error_for_status()
            .context("server refused media")?
            .bytes()
            .await
            .context("reading media body")?;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {:?}", dir))?;
        // Only complete downloads ever appear under the cache name.
        let staging = staging_path(&path);
        tokio::fs::write(&staging, &bytes)
            .await
            .with_context(|| format!("writing {:?}", staging))?;
        tokio::fs::rename(&staging, &path)
            .await
            .with_context(|| format!("renaming {:?}", staging))?;
        Ok(path)
    }

    fn staging_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".part");
        path.with_file_name(name)
    }

}

pub mod projectors {
    //! Read-only projections over the aggregate for summaries and charts.

    use crate::model::DateKey;
    use serde::Serialize;

    /// Inclusive key range; open on a side whose bound is `None`.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct DateRange {
        pub from: Option<DateKey>,
        pub to: Option<DateKey>,
    }

    impl DateRange {
        pub fn contains(&self, key: &DateKey) -> bool {
            self.from.as_ref().is_none_or(|from| key >= from)
                && self.to.as_ref().is_none_or(|to| key <= to)
        }
    }

    pub mod weight_trend {
        use super::DateRange;
        use crate::model::{AppState, DateKey};
        use serde::Serialize;

        #[derive(Debug, Clone, PartialEq, Serialize)]
        pub struct WeightPoint {
            pub date: DateKey,
            pub weight: f64,
        }

        #[derive(Debug, Clone, PartialEq, Serialize)]
        pub struct WeightTrend {
            pub points: Vec<WeightPoint>,
            pub goal: f64,
            pub first: Option<f64>,
            pub last: Option<f64>,
            /// `last - first`.
            pub change: Option<f64>,
            pub min: Option<f64>,
            pub max: Option<f64>,
            /// `last - goal`; positive means above the goal.
            pub to_goal: Option<f64>,
        }

        /// Entries whose weight reads as a number, oldest first.
        pub fn project(state: &AppState, range: &DateRange) -> WeightTrend {
            let points: Vec<WeightPoint> = state
                .entries
                .iter()
                .filter(|(key, _)| range.contains(key))
                .filter_map(|(key, entry)| {
                    entry.weight_value().map(|weight| WeightPoint {
                        date: key.clone(),
                        weight,
                    })
                })
                .collect();

            let goal = state.settings.goal_weight;
            let first = points.first().map(|p| p.weight);
            let last = points.last().map(|p| p.weight);
            let min = points.iter().map(|p| p.weight).reduce(f64::min);
            let max = points.iter().map(|p| p.weight).reduce(f64::max);
            WeightTrend {
                change: first.zip(last).map(|(a, b)| b - a),
                to_goal: last.map(|w| w - goal),
                points,
                goal,
                first,
                last,
                min,
                max,
            }
        }

    }

    pub mod completion {
        use super::DateRange;
        use crate::model::{AppState, DateKey};
        use serde::Serialize;

        #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
        pub struct DayCompletion {
            pub date: DateKey,
            pub done: usize,
            pub total: usize,
        }

        #[derive(Debug, Clone, PartialEq, Serialize)]
        pub struct CompletionSummary {
            pub days: Vec<DayCompletion>,
            pub done: usize,
            pub total: usize,
            /// `done / total`, absent when no items exist in range.
            pub ratio: Option<f64>,
        }

        pub fn project(state: &AppState, range: &DateRange) -> CompletionSummary {
            let days: Vec<DayCompletion> = state
                .entries
                .iter()
                .filter(|(key, _)| range.contains(key))
                .map(|(key, entry)| {
                    let (done, total) = entry.progress();
                    DayCompletion {
                        date: key.clone(),
                        done,
                        total,
                    }
                })
                .collect();
            let done: usize = days.iter().map(|d| d.done).sum();
            let total: usize = days.iter().map(|d| d.total).sum();
            CompletionSummary {
                ratio: (total > 0).then(|| done as f64 / total as f64),
                days,
                done,
                total,
            }
        }

    }
}

pub use dates::{canonical_date_key, today_key, weekday_label};
pub use media::normalize;
pub use store::{Store, StoreError};
