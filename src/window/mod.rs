use std::fmt;

/// Source of the external "call in progress" signal.
pub trait WindowSignal {
    fn is_target_active(&mut self) -> Result<bool, SignalError>;
}

#[derive(Debug)]
pub enum SignalError {
    Enumerate(String),
    #[cfg_attr(windows, allow(dead_code))]
    ToolMissing(&'static str),
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enumerate(err) => write!(f, "window enumeration failed: {err}"),
            Self::ToolMissing(tool) => write!(f, "{tool} is not installed"),
        }
    }
}

impl std::error::Error for SignalError {}

/// Title predicate: the title names the application (case-sensitive) and
/// contains one of the call indicators (case-insensitive).
#[derive(Debug, Clone)]
pub struct TitleMatcher {
    app_name: String,
    indicators: Vec<String>,
}

impl TitleMatcher {
    pub fn new(app_name: impl Into<String>, indicators: &[String]) -> Self {
        Self {
            app_name: app_name.into(),
            indicators: indicators
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, title: &str) -> bool {
        if !title.contains(&self.app_name) {
            return false;
        }
        let lowered = title.to_lowercase();
        self.indicators.iter().any(|ind| lowered.contains(ind))
    }
}

/// Top-level windows of the local desktop.
pub struct DesktopWindows {
    matcher: TitleMatcher,
}

impl DesktopWindows {
    pub fn new(matcher: TitleMatcher) -> Self {
        Self { matcher }
    }

    pub fn matching_titles(&self) -> Result<Vec<String>, SignalError> {
        Ok(window_titles()?
            .into_iter()
            .filter(|title| self.matcher.matches(title))
            .collect())
    }
}

impl WindowSignal for DesktopWindows {
    fn is_target_active(&mut self) -> Result<bool, SignalError> {
        self.matching_titles().map(|titles| !titles.is_empty())
    }
}

#[cfg(windows)]
fn window_titles() -> Result<Vec<String>, SignalError> {
    use windows::Win32::Foundation::{BOOL, HWND, LPARAM};
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetWindowTextLengthW, GetWindowTextW, IsWindowVisible,
    };

    unsafe extern "system" fn collect(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let titles = &mut *(lparam.0 as *mut Vec<String>);
        if IsWindowVisible(hwnd).as_bool() {
            let len = GetWindowTextLengthW(hwnd);
            if len > 0 {
                let mut buffer = vec![0u16; len as usize + 1];
                let copied = GetWindowTextW(hwnd, &mut buffer);
                if copied > 0 {
                    titles.push(String::from_utf16_lossy(&buffer[..copied as usize]));
                }
            }
        }
        BOOL(1)
    }

    let mut titles: Vec<String> = Vec::new();
    unsafe {
        EnumWindows(
            Some(collect),
            LPARAM(&mut titles as *mut Vec<String> as isize),
        )
    }
    .map_err(|err| SignalError::Enumerate(err.to_string()))?;
    Ok(titles)
}

#[cfg(not(windows))]
fn window_titles() -> Result<Vec<String>, SignalError> {
    let output = match std::process::Command::new("wmctrl").arg("-l").output() {
        Ok(output) => output,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(SignalError::ToolMissing("wmctrl"));
        }
        Err(err) => return Err(SignalError::Enumerate(err.to_string())),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SignalError::Enumerate(format!(
            "wmctrl exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(parse_wmctrl(&String::from_utf8_lossy(&output.stdout)))
}

/// Titles from `wmctrl -l` output: window id, desktop and host precede the title.
#[cfg_attr(windows, allow(dead_code))]
fn parse_wmctrl(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut rest = line.trim_start();
            for _ in 0..3 {
                let end = rest.find(char::is_whitespace)?;
                rest = rest[end..].trim_start();
            }
            let title = rest.trim_end();
            (!title.is_empty()).then(|| title.to_string())
        })
        .collect()
}
