use url::Url;

pub fn get_filename_from_url(url: &Url) -> String {
    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                return filename.to_string();
            }
        }
    }

    // Fallback if no filename found in path
    format!("download_{}", uuid::Uuid::new_v4())
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}
