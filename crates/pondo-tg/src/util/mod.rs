//! Assorted utility functions (missing batteries).
mod std_ext;
mod teloxide_ext;

pub(crate) type DynError = dyn std::error::Error + Send + Sync;
pub(crate) type DynResult<T = ()> = Result<T, Box<DynError>>;

// We don't care if some of the imports here are not used. They may be used
// at some point. It's just convenient not to import them manually all the
// time a new extension method is needed.
#[allow(unused_imports)]
pub(crate) mod prelude {
    pub(crate) use super::std_ext::ErrorExt as _;
    pub(crate) use crate::http::RequestBuilderExt as _;
    pub(crate) use super::teloxide_ext::ChatExt as _;
    pub(crate) use super::teloxide_ext::UserExt as _;
    pub(crate) use super::teloxide_ext::UtilRequesterExt as _;
}

macro_rules! def_url_base {
    ($vis:vis $ident:ident, $url:literal) => {
        $vis fn $ident<T: AsRef<str>>(segments: impl IntoIterator<Item = T>) -> ::url::Url {
            let mut url: ::url::Url = $url.parse().unwrap();
            url.path_segments_mut().unwrap().extend(segments);
            url
        }
    };
}

pub(crate) use def_url_base;
